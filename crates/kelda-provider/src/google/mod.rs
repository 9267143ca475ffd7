//! Google Compute Engine adapter.
//!
//! Instances live on a namespaced network with one firewall carrying the
//! namespace's ACLs. Zones stand in for regions. Preemptible machines map
//! directly onto GCE preemptible instances; floating IPs are reserved
//! static addresses swapped in through access configs.

mod client;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::cfg::cloud_config;
use crate::error::ProviderResult;
use crate::namespace_tag;
use crate::types::{Acl, Machine};
use crate::Provider;

pub use client::{HttpGceClient, MetadataTokenSource, TokenSource};

/// The GCE zones machines may be requested in.
pub const ZONES: &[&str] = &["us-central1-a", "us-east1-b", "europe-west1-b", "asia-east1-a"];

// ── Client interface ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GceInstance {
    pub name: String,
    pub size: String,
    pub public_ip: String,
    pub private_ip: String,
    pub preemptible: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceRequest {
    pub name: String,
    pub network: String,
    pub size: String,
    pub disk_size_gib: i32,
    pub preemptible: bool,
    pub user_data: String,
}

/// A namespaced firewall in GCE's shape: one rule object carrying every
/// allowed port range and source CIDR.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirewallDescription {
    pub name: String,
    pub network: String,
    /// "tcp:80-80" style entries, sorted.
    pub allowed: Vec<String>,
    /// Source CIDRs, sorted.
    pub source_ranges: Vec<String>,
}

/// The slice of the GCE API the adapter drives.
#[async_trait]
pub trait GceClient: Send + Sync {
    async fn list_instances(&self, name_prefix: &str) -> anyhow::Result<Vec<GceInstance>>;
    async fn insert_instance(&self, req: InstanceRequest) -> anyhow::Result<()>;
    async fn delete_instance(&self, name: &str) -> anyhow::Result<()>;

    async fn network_exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn insert_network(&self, name: &str) -> anyhow::Result<()>;
    async fn delete_network(&self, name: &str) -> anyhow::Result<()>;

    async fn get_firewall(&self, name: &str) -> anyhow::Result<Option<FirewallDescription>>;
    async fn insert_firewall(&self, firewall: FirewallDescription) -> anyhow::Result<()>;
    async fn patch_firewall(&self, firewall: FirewallDescription) -> anyhow::Result<()>;
    async fn delete_firewall(&self, name: &str) -> anyhow::Result<()>;

    /// Reserved static external addresses in this region.
    async fn list_static_ips(&self) -> anyhow::Result<Vec<String>>;
    async fn add_access_config(&self, instance: &str, nat_ip: &str) -> anyhow::Result<()>;
    async fn delete_access_config(&self, instance: &str) -> anyhow::Result<()>;
}

// ── Adapter ────────────────────────────────────────────────────────

/// The GCE adapter for one zone.
pub struct Google {
    namespace: String,
    client: Box<dyn GceClient>,
}

impl Google {
    /// Connect to GCE in `zone` and verify credentials with a list call.
    pub async fn new(namespace: &str, zone: &str) -> ProviderResult<Google> {
        let client = HttpGceClient::from_env(zone)?;
        let prvdr = Google::with_client(namespace, Box::new(client));
        prvdr.list().await?;
        Ok(prvdr)
    }

    /// Build an adapter over an explicit client. Used by tests.
    pub fn with_client(namespace: &str, client: Box<dyn GceClient>) -> Google {
        Google {
            namespace: namespace.to_lowercase(),
            client,
        }
    }

    fn network_name(&self) -> String {
        namespace_tag(&self.namespace)
    }

    fn instance_prefix(&self) -> String {
        format!("{}-", self.network_name())
    }

    async fn ensure_network(&self) -> anyhow::Result<()> {
        let name = self.network_name();
        if !self.client.network_exists(&name).await? {
            info!(network = %name, "Google: creating network");
            self.client.insert_network(&name).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for Google {
    async fn list(&self) -> ProviderResult<Vec<Machine>> {
        let instances = self.client.list_instances(&self.instance_prefix()).await?;
        let static_ips = self.client.list_static_ips().await?;

        let machines = instances
            .into_iter()
            .map(|inst| {
                // A public IP drawn from the reserved pool is a floating IP.
                let floating_ip = if static_ips.contains(&inst.public_ip) {
                    inst.public_ip.clone()
                } else {
                    String::new()
                };
                Machine {
                    cloud_id: inst.name,
                    public_ip: inst.public_ip,
                    private_ip: inst.private_ip,
                    floating_ip,
                    size: inst.size,
                    preemptible: inst.preemptible,
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
        self.ensure_network().await?;

        let mut names = Vec::new();
        for m in &machines {
            let name = format!("{}{}", self.instance_prefix(), short_id());
            self.client
                .insert_instance(InstanceRequest {
                    name: name.clone(),
                    network: self.network_name(),
                    size: m.size.clone(),
                    disk_size_gib: m.disk_size,
                    preemptible: m.preemptible,
                    user_data: cloud_config(m),
                })
                .await?;
            names.push(name);
        }
        Ok(names)
    }

    async fn stop(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        let mut errors = Vec::new();
        for m in machines {
            if let Err(e) = self.client.delete_instance(&m.cloud_id).await {
                errors.push(format!("delete {}: {e}", m.cloud_id));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{}", errors.join(", ")).into())
        }
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> ProviderResult<()> {
        let name = self.network_name();
        let current = self.client.get_firewall(&name).await?;

        if acls.is_empty() {
            if let Some(current) = current {
                info!(firewall = %current.name, "Google: deleting firewall");
                self.client.delete_firewall(&current.name).await?;
            }
            return Ok(());
        }

        self.ensure_network().await?;
        let desired = firewall_for(&name, &acls);
        match current {
            None => {
                info!(firewall = %name, "Google: creating firewall");
                self.client.insert_firewall(desired).await?;
            }
            Some(current)
                if current.allowed != desired.allowed
                    || current.source_ranges != desired.source_ranges =>
            {
                info!(firewall = %name, "Google: updating firewall");
                self.client.patch_firewall(desired).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        for m in machines {
            self.client.delete_access_config(&m.cloud_id).await?;
            // An empty desired floating IP falls back to an ephemeral
            // address so the machine keeps public connectivity.
            self.client
                .add_access_config(&m.cloud_id, &m.floating_ip)
                .await?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> ProviderResult<()> {
        let name = self.network_name();
        if self.client.get_firewall(&name).await?.is_some() {
            self.client.delete_firewall(&name).await?;
        }
        if self.client.network_exists(&name).await? {
            self.client.delete_network(&name).await?;
        }
        Ok(())
    }
}

/// The desired firewall for a set of ACLs. Allowed entries and source
/// ranges are sorted so converged firewalls compare equal.
fn firewall_for(name: &str, acls: &[Acl]) -> FirewallDescription {
    let mut allowed = Vec::new();
    let mut sources = Vec::new();
    for acl in acls {
        for protocol in ["tcp", "udp"] {
            allowed.push(format!("{}:{}-{}", protocol, acl.min_port, acl.max_port));
        }
        sources.push(acl.cidr_ip.clone());
    }
    allowed.push("icmp".to_string());
    allowed.sort();
    allowed.dedup();
    sources.sort();
    sources.dedup();

    FirewallDescription {
        name: name.to_string(),
        network: name.to_string(),
        allowed,
        source_ranges: sources,
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGce {
        instances: Mutex<Vec<GceInstance>>,
        networks: Mutex<Vec<String>>,
        firewall: Mutex<Option<FirewallDescription>>,
        static_ips: Mutex<Vec<String>>,
        patched: Mutex<u32>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GceClient for std::sync::Arc<FakeGce> {
        async fn list_instances(&self, prefix: &str) -> anyhow::Result<Vec<GceInstance>> {
            Ok(self
                .instances
                .lock()
                .unwrap()
                .iter()
                .filter(|i| i.name.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn insert_instance(&self, req: InstanceRequest) -> anyhow::Result<()> {
            self.instances.lock().unwrap().push(GceInstance {
                name: req.name,
                size: req.size,
                preemptible: req.preemptible,
                ..Default::default()
            });
            Ok(())
        }

        async fn delete_instance(&self, name: &str) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn network_exists(&self, name: &str) -> anyhow::Result<bool> {
            Ok(self.networks.lock().unwrap().contains(&name.to_string()))
        }

        async fn insert_network(&self, name: &str) -> anyhow::Result<()> {
            self.networks.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn delete_network(&self, name: &str) -> anyhow::Result<()> {
            self.networks.lock().unwrap().retain(|n| n != name);
            Ok(())
        }

        async fn get_firewall(&self, _: &str) -> anyhow::Result<Option<FirewallDescription>> {
            Ok(self.firewall.lock().unwrap().clone())
        }

        async fn insert_firewall(&self, firewall: FirewallDescription) -> anyhow::Result<()> {
            *self.firewall.lock().unwrap() = Some(firewall);
            Ok(())
        }

        async fn patch_firewall(&self, firewall: FirewallDescription) -> anyhow::Result<()> {
            *self.patched.lock().unwrap() += 1;
            *self.firewall.lock().unwrap() = Some(firewall);
            Ok(())
        }

        async fn delete_firewall(&self, _: &str) -> anyhow::Result<()> {
            *self.firewall.lock().unwrap() = None;
            Ok(())
        }

        async fn list_static_ips(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.static_ips.lock().unwrap().clone())
        }

        async fn add_access_config(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete_access_config(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn google() -> (Google, std::sync::Arc<FakeGce>) {
        let fake = std::sync::Arc::new(FakeGce::default());
        let prvdr = Google::with_client("ns", Box::new(std::sync::Arc::clone(&fake)));
        (prvdr, fake)
    }

    #[tokio::test]
    async fn boot_creates_network_and_instances() {
        let (prvdr, fake) = google();
        let machine = Machine {
            size: "n1-standard-1".to_string(),
            preemptible: true,
            ..Default::default()
        };
        let ids = prvdr.boot(vec![machine]).await.unwrap();

        assert_eq!(ids.len(), 1);
        assert!(ids[0].starts_with("kelda-ns-"));
        assert_eq!(*fake.networks.lock().unwrap(), vec!["kelda-ns".to_string()]);

        let machines = prvdr.list().await.unwrap();
        assert_eq!(machines.len(), 1);
        assert!(machines[0].preemptible);
    }

    #[tokio::test]
    async fn list_marks_reserved_ips_as_floating() {
        let (prvdr, fake) = google();
        fake.instances.lock().unwrap().push(GceInstance {
            name: "kelda-ns-abc".to_string(),
            public_ip: "35.0.0.1".to_string(),
            ..Default::default()
        });
        fake.static_ips.lock().unwrap().push("35.0.0.1".to_string());

        let machines = prvdr.list().await.unwrap();
        assert_eq!(machines[0].floating_ip, "35.0.0.1");
    }

    #[tokio::test]
    async fn set_acls_inserts_then_patches() {
        let (prvdr, fake) = google();
        let acl = Acl {
            cidr_ip: "1.2.3.4/32".to_string(),
            min_port: 80,
            max_port: 80,
        };
        prvdr.set_acls(vec![acl.clone()]).await.unwrap();
        assert!(fake.firewall.lock().unwrap().is_some());
        assert_eq!(*fake.patched.lock().unwrap(), 0);

        // Converged: a second identical call changes nothing.
        prvdr.set_acls(vec![acl]).await.unwrap();
        assert_eq!(*fake.patched.lock().unwrap(), 0);

        // A different policy patches in place.
        let other = Acl {
            cidr_ip: "5.6.7.8/32".to_string(),
            min_port: 22,
            max_port: 22,
        };
        prvdr.set_acls(vec![other]).await.unwrap();
        assert_eq!(*fake.patched.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_acls_delete_the_firewall() {
        let (prvdr, fake) = google();
        *fake.firewall.lock().unwrap() = Some(FirewallDescription {
            name: "kelda-ns".to_string(),
            ..Default::default()
        });

        prvdr.set_acls(Vec::new()).await.unwrap();
        assert!(fake.firewall.lock().unwrap().is_none());
    }
}
