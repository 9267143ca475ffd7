//! DigitalOcean adapter.
//!
//! Droplets are tagged with the namespace tag and firewalled by a cloud
//! firewall named after the namespace that targets that tag. Floating IPs
//! map directly onto DigitalOcean floating IPs. Disk size is implied by
//! the droplet size slug; preemptible machines are not expressible here
//! and surface as validation errors.

mod client;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::info;

use kelda_join::hash_join;

use crate::cfg::cloud_config;
use crate::error::{ProviderError, ProviderResult};
use crate::namespace_tag;
use crate::types::{Acl, Machine};
use crate::Provider;

pub use client::HttpDoClient;

/// The DigitalOcean regions machines may be requested in.
pub const REGIONS: &[&str] = &["nyc1", "nyc2", "sfo1", "sfo2", "lon1", "fra1", "sgp1"];

// ── Client interface ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DropletDescription {
    pub id: i64,
    pub public_ip: String,
    pub private_ip: String,
    pub size: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloatingIpDescription {
    pub ip: String,
    pub droplet_id: Option<i64>,
}

/// One inbound firewall rule in DigitalOcean's shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirewallRule {
    pub protocol: String,
    /// "80", "80-100", or "" for protocols without ports (ICMP).
    pub ports: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirewallDescription {
    pub id: String,
    pub inbound: Vec<FirewallRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropletRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub user_data: String,
    pub tags: Vec<String>,
}

/// The slice of the DigitalOcean API the adapter drives.
#[async_trait]
pub trait DoClient: Send + Sync {
    async fn list_droplets(&self, tag: &str) -> anyhow::Result<Vec<DropletDescription>>;
    async fn create_droplet(&self, req: DropletRequest) -> anyhow::Result<i64>;
    async fn delete_droplet(&self, id: i64) -> anyhow::Result<()>;

    async fn list_floating_ips(&self) -> anyhow::Result<Vec<FloatingIpDescription>>;
    async fn assign_floating_ip(&self, ip: &str, droplet_id: i64) -> anyhow::Result<()>;
    async fn unassign_floating_ip(&self, ip: &str) -> anyhow::Result<()>;

    async fn get_firewall(&self, name: &str) -> anyhow::Result<Option<FirewallDescription>>;
    async fn create_firewall(
        &self,
        name: &str,
        tag: &str,
        rules: Vec<FirewallRule>,
    ) -> anyhow::Result<String>;
    async fn add_firewall_rules(&self, id: &str, rules: Vec<FirewallRule>) -> anyhow::Result<()>;
    async fn remove_firewall_rules(
        &self,
        id: &str,
        rules: Vec<FirewallRule>,
    ) -> anyhow::Result<()>;
    async fn delete_firewall(&self, id: &str) -> anyhow::Result<()>;

    async fn create_tag(&self, name: &str) -> anyhow::Result<()>;
}

// ── Adapter ────────────────────────────────────────────────────────

/// The DigitalOcean adapter for one region.
pub struct DigitalOcean {
    namespace: String,
    region: String,
    client: Box<dyn DoClient>,
}

impl DigitalOcean {
    /// Connect using the token in `DIGITALOCEAN_TOKEN`.
    pub fn new(namespace: &str, region: &str) -> ProviderResult<DigitalOcean> {
        let token = std::env::var("DIGITALOCEAN_TOKEN")
            .map_err(|_| anyhow!("DIGITALOCEAN_TOKEN is not set"))?;
        Ok(DigitalOcean::with_client(
            namespace,
            region,
            Box::new(HttpDoClient::new(&token)),
        ))
    }

    /// Build an adapter over an explicit client. Used by tests.
    pub fn with_client(namespace: &str, region: &str, client: Box<dyn DoClient>) -> DigitalOcean {
        DigitalOcean {
            namespace: namespace.to_lowercase(),
            region: region.to_string(),
            client,
        }
    }

    fn tag(&self) -> String {
        namespace_tag(&self.namespace)
    }
}

#[async_trait]
impl Provider for DigitalOcean {
    async fn list(&self) -> ProviderResult<Vec<Machine>> {
        let droplets = self.client.list_droplets(&self.tag()).await?;
        let floating = self.client.list_floating_ips().await?;

        let machines = droplets
            .into_iter()
            .map(|d| {
                let floating_ip = floating
                    .iter()
                    .find(|f| f.droplet_id == Some(d.id))
                    .map(|f| f.ip.clone())
                    .unwrap_or_default();
                Machine {
                    cloud_id: d.id.to_string(),
                    public_ip: d.public_ip,
                    private_ip: d.private_ip,
                    floating_ip,
                    size: d.size,
                    ..Default::default()
                }
            })
            .collect();
        Ok(machines)
    }

    async fn boot(&self, machines: Vec<Machine>) -> ProviderResult<Vec<String>> {
        if machines.is_empty() {
            return Ok(Vec::new());
        }
        for m in &machines {
            if m.preemptible {
                return Err(ProviderError::Unsupported(
                    "DigitalOcean does not support preemptible instances".to_string(),
                ));
            }
        }

        self.client.create_tag(&self.tag()).await?;

        let mut ids = Vec::new();
        for m in &machines {
            let id = self
                .client
                .create_droplet(DropletRequest {
                    name: self.namespace.clone(),
                    region: self.region.clone(),
                    size: m.size.clone(),
                    user_data: cloud_config(m),
                    tags: vec![self.tag()],
                })
                .await?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    async fn stop(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        let mut errors = Vec::new();
        for m in machines {
            let id: i64 = match m.cloud_id.parse() {
                Ok(id) => id,
                Err(_) => {
                    errors.push(format!("bad droplet id {:?}", m.cloud_id));
                    continue;
                }
            };
            if let Err(e) = self.client.delete_droplet(id).await {
                errors.push(format!("delete droplet {id}: {e}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{}", errors.join(", ")).into())
        }
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> ProviderResult<()> {
        let desired = acls_to_rules(&acls);
        let firewall = self.client.get_firewall(&self.namespace).await?;

        let Some(firewall) = firewall else {
            self.client
                .create_firewall(&self.namespace, &self.tag(), desired)
                .await?;
            return Ok(());
        };

        let joined = hash_join(
            desired,
            firewall.inbound,
            |r: &FirewallRule| r.clone(),
            |r: &FirewallRule| r.clone(),
        );
        if !joined.left_only.is_empty() {
            info!(count = joined.left_only.len(), "DigitalOcean: adding firewall rules");
            self.client
                .add_firewall_rules(&firewall.id, joined.left_only)
                .await?;
        }
        if !joined.right_only.is_empty() {
            info!(count = joined.right_only.len(), "DigitalOcean: removing firewall rules");
            self.client
                .remove_firewall_rules(&firewall.id, joined.right_only)
                .await?;
        }
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        let floating = self.client.list_floating_ips().await?;

        for m in machines {
            let droplet_id: i64 = m
                .cloud_id
                .parse()
                .map_err(|_| anyhow!("bad droplet id {:?}", m.cloud_id))?;

            if m.floating_ip.is_empty() {
                let current = floating.iter().find(|f| f.droplet_id == Some(droplet_id));
                if let Some(current) = current {
                    self.client.unassign_floating_ip(&current.ip).await?;
                }
            } else {
                self.client
                    .assign_floating_ip(&m.floating_ip, droplet_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> ProviderResult<()> {
        if let Some(firewall) = self.client.get_firewall(&self.namespace).await? {
            self.client.delete_firewall(&firewall.id).await?;
        }
        Ok(())
    }
}

/// Expand ACLs into DigitalOcean inbound rules: TCP and UDP per port
/// range, ICMP per source.
fn acls_to_rules(acls: &[Acl]) -> Vec<FirewallRule> {
    let mut rules = Vec::new();
    for acl in acls {
        let ports = if acl.min_port == acl.max_port {
            acl.min_port.to_string()
        } else {
            format!("{}-{}", acl.min_port, acl.max_port)
        };
        for protocol in ["tcp", "udp"] {
            rules.push(FirewallRule {
                protocol: protocol.to_string(),
                ports: ports.clone(),
                source: acl.cidr_ip.clone(),
            });
        }
        rules.push(FirewallRule {
            protocol: "icmp".to_string(),
            ports: String::new(),
            source: acl.cidr_ip.clone(),
        });
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDo {
        droplets: Mutex<Vec<DropletDescription>>,
        floating: Mutex<Vec<FloatingIpDescription>>,
        firewall: Mutex<Option<FirewallDescription>>,
        added: Mutex<Vec<FirewallRule>>,
        removed: Mutex<Vec<FirewallRule>>,
        assigned: Mutex<Vec<(String, i64)>>,
        unassigned: Mutex<Vec<String>>,
        deleted: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl DoClient for std::sync::Arc<FakeDo> {
        async fn list_droplets(&self, _: &str) -> anyhow::Result<Vec<DropletDescription>> {
            Ok(self.droplets.lock().unwrap().clone())
        }

        async fn create_droplet(&self, req: DropletRequest) -> anyhow::Result<i64> {
            let mut droplets = self.droplets.lock().unwrap();
            let id = droplets.len() as i64 + 1;
            droplets.push(DropletDescription {
                id,
                size: req.size,
                ..Default::default()
            });
            Ok(id)
        }

        async fn delete_droplet(&self, id: i64) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }

        async fn list_floating_ips(&self) -> anyhow::Result<Vec<FloatingIpDescription>> {
            Ok(self.floating.lock().unwrap().clone())
        }

        async fn assign_floating_ip(&self, ip: &str, droplet_id: i64) -> anyhow::Result<()> {
            self.assigned.lock().unwrap().push((ip.to_string(), droplet_id));
            Ok(())
        }

        async fn unassign_floating_ip(&self, ip: &str) -> anyhow::Result<()> {
            self.unassigned.lock().unwrap().push(ip.to_string());
            Ok(())
        }

        async fn get_firewall(&self, _: &str) -> anyhow::Result<Option<FirewallDescription>> {
            Ok(self.firewall.lock().unwrap().clone())
        }

        async fn create_firewall(
            &self,
            _: &str,
            _: &str,
            rules: Vec<FirewallRule>,
        ) -> anyhow::Result<String> {
            *self.firewall.lock().unwrap() = Some(FirewallDescription {
                id: "fw-1".to_string(),
                inbound: rules,
            });
            Ok("fw-1".to_string())
        }

        async fn add_firewall_rules(
            &self,
            _: &str,
            rules: Vec<FirewallRule>,
        ) -> anyhow::Result<()> {
            self.added.lock().unwrap().extend(rules);
            Ok(())
        }

        async fn remove_firewall_rules(
            &self,
            _: &str,
            rules: Vec<FirewallRule>,
        ) -> anyhow::Result<()> {
            self.removed.lock().unwrap().extend(rules);
            Ok(())
        }

        async fn delete_firewall(&self, _: &str) -> anyhow::Result<()> {
            *self.firewall.lock().unwrap() = None;
            Ok(())
        }

        async fn create_tag(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn digitalocean() -> (DigitalOcean, std::sync::Arc<FakeDo>) {
        let fake = std::sync::Arc::new(FakeDo::default());
        let prvdr = DigitalOcean::with_client("ns", "sfo1", Box::new(std::sync::Arc::clone(&fake)));
        (prvdr, fake)
    }

    #[tokio::test]
    async fn boot_rejects_preemptible() {
        let (prvdr, _) = digitalocean();
        let machine = Machine {
            preemptible: true,
            ..Default::default()
        };
        let err = prvdr.boot(vec![machine]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }

    #[tokio::test]
    async fn boot_then_list_round_trips() {
        let (prvdr, _) = digitalocean();
        let machine = Machine {
            size: "s-1vcpu-1gb".to_string(),
            ..Default::default()
        };
        let ids = prvdr.boot(vec![machine]).await.unwrap();
        assert_eq!(ids, vec!["1".to_string()]);

        let machines = prvdr.list().await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].cloud_id, "1");
        assert_eq!(machines[0].size, "s-1vcpu-1gb");
    }

    #[tokio::test]
    async fn set_acls_creates_firewall_when_missing() {
        let (prvdr, fake) = digitalocean();
        let acl = Acl {
            cidr_ip: "1.2.3.4/32".to_string(),
            min_port: 80,
            max_port: 80,
        };
        prvdr.set_acls(vec![acl.clone()]).await.unwrap();

        let firewall = fake.firewall.lock().unwrap().clone().unwrap();
        assert_eq!(firewall.inbound, acls_to_rules(&[acl]));
    }

    #[tokio::test]
    async fn set_acls_diffs_existing_firewall() {
        let (prvdr, fake) = digitalocean();
        let stale = Acl {
            cidr_ip: "5.6.7.8/32".to_string(),
            min_port: 22,
            max_port: 22,
        };
        *fake.firewall.lock().unwrap() = Some(FirewallDescription {
            id: "fw-1".to_string(),
            inbound: acls_to_rules(&[stale.clone()]),
        });

        let desired = Acl {
            cidr_ip: "1.2.3.4/32".to_string(),
            min_port: 80,
            max_port: 80,
        };
        prvdr.set_acls(vec![desired.clone()]).await.unwrap();

        assert_eq!(*fake.added.lock().unwrap(), acls_to_rules(&[desired]));
        assert_eq!(*fake.removed.lock().unwrap(), acls_to_rules(&[stale]));
    }

    #[tokio::test]
    async fn update_floating_ips() {
        let (prvdr, fake) = digitalocean();
        fake.floating.lock().unwrap().push(FloatingIpDescription {
            ip: "9.9.9.9".to_string(),
            droplet_id: Some(2),
        });

        let wants = Machine {
            cloud_id: "1".to_string(),
            floating_ip: "1.2.3.4".to_string(),
            ..Default::default()
        };
        let drops = Machine {
            cloud_id: "2".to_string(),
            ..Default::default()
        };
        prvdr.update_floating_ips(vec![wants, drops]).await.unwrap();

        assert_eq!(
            *fake.assigned.lock().unwrap(),
            vec![("1.2.3.4".to_string(), 1)]
        );
        assert_eq!(*fake.unassigned.lock().unwrap(), vec!["9.9.9.9".to_string()]);
    }

    #[tokio::test]
    async fn stop_reports_combined_errors() {
        let (prvdr, fake) = digitalocean();
        let good = Machine {
            cloud_id: "7".to_string(),
            ..Default::default()
        };
        let bad = Machine {
            cloud_id: "not-a-number".to_string(),
            ..Default::default()
        };
        let err = prvdr.stop(vec![good, bad]).await.unwrap_err();
        assert!(err.to_string().contains("not-a-number"));
        // The parseable droplet was still deleted.
        assert_eq!(*fake.deleted.lock().unwrap(), vec![7]);
    }
}
