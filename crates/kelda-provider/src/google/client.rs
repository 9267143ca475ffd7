//! The real GCE REST client.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{FirewallDescription, GceClient, GceInstance, InstanceRequest};

const API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Source of OAuth bearer tokens for the GCE API.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> anyhow::Result<String>;
}

/// The default token source: the GCE metadata server, i.e. the standard
/// application-default-credentials path when running on GCE.
pub struct MetadataTokenSource {
    http: reqwest::Client,
}

impl Default for MetadataTokenSource {
    fn default() -> Self {
        MetadataTokenSource {
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> anyhow::Result<String> {
        let resp = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("metadata token request")?;
        let parsed: TokenResponse = resp.json().await?;
        Ok(parsed.access_token)
    }
}

/// GCE client for one project and zone.
pub struct HttpGceClient {
    http: reqwest::Client,
    tokens: Box<dyn TokenSource>,
    project: String,
    zone: String,
}

impl HttpGceClient {
    /// Build a client for `zone`, reading the project id from
    /// `GOOGLE_PROJECT` and tokens from the metadata server.
    pub fn from_env(zone: &str) -> anyhow::Result<HttpGceClient> {
        let project =
            std::env::var("GOOGLE_PROJECT").map_err(|_| anyhow!("GOOGLE_PROJECT is not set"))?;
        Ok(HttpGceClient {
            http: reqwest::Client::new(),
            tokens: Box::<MetadataTokenSource>::default(),
            project,
            zone: zone.to_string(),
        })
    }

    fn region(&self) -> String {
        // Zone "us-central1-a" lives in region "us-central1".
        match self.zone.rsplit_once('-') {
            Some((region, _)) => region.to_string(),
            None => self.zone.clone(),
        }
    }

    fn zone_url(&self, path: &str) -> String {
        format!(
            "{API_BASE}/projects/{}/zones/{}/{path}",
            self.project, self.zone
        )
    }

    fn global_url(&self, path: &str) -> String {
        format!("{API_BASE}/projects/{}/global/{path}", self.project)
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
    ) -> anyhow::Result<reqwest::Response> {
        let token = self.tokens.token().await?;
        let resp = req.bearer_auth(token).send().await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("GCE API error {status}: {body}"))
    }
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
}

#[derive(Deserialize)]
struct Instance {
    name: String,
    #[serde(rename = "machineType", default)]
    machine_type: String,
    #[serde(default)]
    scheduling: Scheduling,
    #[serde(rename = "networkInterfaces", default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize, Default)]
struct Scheduling {
    #[serde(default)]
    preemptible: bool,
}

#[derive(Deserialize)]
struct NetworkInterface {
    #[serde(rename = "networkIP", default)]
    network_ip: String,
    #[serde(rename = "accessConfigs", default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP", default)]
    nat_ip: String,
}

#[derive(Deserialize)]
struct Firewall {
    name: String,
    #[serde(default)]
    network: String,
    #[serde(default)]
    allowed: Vec<Allowed>,
    #[serde(rename = "sourceRanges", default)]
    source_ranges: Vec<String>,
}

#[derive(Deserialize)]
struct Allowed {
    #[serde(rename = "IPProtocol")]
    ip_protocol: String,
    #[serde(default)]
    ports: Vec<String>,
}

#[derive(Deserialize)]
struct AddressList {
    #[serde(default)]
    items: Vec<Address>,
}

#[derive(Deserialize)]
struct Address {
    address: String,
}

fn last_segment(url: &str) -> String {
    url.rsplit('/').next().unwrap_or_default().to_string()
}

/// Normalize "80" and "80-80" to the same "proto:80-80" form so desired
/// and observed firewalls compare equal.
fn allowed_entry(protocol: &str, port: &str) -> String {
    if port.is_empty() {
        return protocol.to_string();
    }
    match port.split_once('-') {
        Some(_) => format!("{protocol}:{port}"),
        None => format!("{protocol}:{port}-{port}"),
    }
}

fn allowed_json(allowed: &[String]) -> Vec<serde_json::Value> {
    allowed
        .iter()
        .map(|entry| match entry.split_once(':') {
            Some((protocol, ports)) => json!({"IPProtocol": protocol, "ports": [ports]}),
            None => json!({"IPProtocol": entry}),
        })
        .collect()
}

#[async_trait]
impl GceClient for HttpGceClient {
    async fn list_instances(&self, name_prefix: &str) -> anyhow::Result<Vec<GceInstance>> {
        let resp = self
            .send(self.http.get(self.zone_url("instances")))
            .await
            .context("list instances")?;
        let parsed: InstanceList = resp.json().await?;

        Ok(parsed
            .items
            .into_iter()
            .filter(|i| i.name.starts_with(name_prefix))
            .map(|i| {
                let iface = i.network_interfaces.first();
                GceInstance {
                    name: i.name,
                    size: last_segment(&i.machine_type),
                    public_ip: iface
                        .and_then(|n| n.access_configs.first())
                        .map(|a| a.nat_ip.clone())
                        .unwrap_or_default(),
                    private_ip: iface.map(|n| n.network_ip.clone()).unwrap_or_default(),
                    preemptible: i.scheduling.preemptible,
                }
            })
            .collect())
    }

    async fn insert_instance(&self, req: InstanceRequest) -> anyhow::Result<()> {
        let body = json!({
            "name": req.name,
            "machineType": format!("zones/{}/machineTypes/{}", self.zone, req.size),
            "scheduling": {"preemptible": req.preemptible},
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": "projects/ubuntu-os-cloud/global/images/family/ubuntu-1604-lts",
                    "diskSizeGb": req.disk_size_gib,
                },
            }],
            "networkInterfaces": [{
                "network": format!("global/networks/{}", req.network),
                "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "name": "External NAT"}],
            }],
            "metadata": {
                "items": [{"key": "user-data", "value": req.user_data}],
            },
        });
        self.send(self.http.post(self.zone_url("instances")).json(&body))
            .await
            .context("insert instance")?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> anyhow::Result<()> {
        self.send(
            self.http
                .delete(self.zone_url(&format!("instances/{name}"))),
        )
        .await
        .context("delete instance")?;
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> anyhow::Result<bool> {
        let resp = self
            .send(self.http.get(self.global_url(&format!("networks/{name}"))))
            .await
            .context("get network")?;
        Ok(resp.status() != StatusCode::NOT_FOUND)
    }

    async fn insert_network(&self, name: &str) -> anyhow::Result<()> {
        let body = json!({"name": name, "autoCreateSubnetworks": true});
        self.send(self.http.post(self.global_url("networks")).json(&body))
            .await
            .context("insert network")?;
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> anyhow::Result<()> {
        self.send(
            self.http
                .delete(self.global_url(&format!("networks/{name}"))),
        )
        .await
        .context("delete network")?;
        Ok(())
    }

    async fn get_firewall(&self, name: &str) -> anyhow::Result<Option<FirewallDescription>> {
        let resp = self
            .send(self.http.get(self.global_url(&format!("firewalls/{name}"))))
            .await
            .context("get firewall")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: Firewall = resp.json().await?;

        let mut allowed = Vec::new();
        for entry in &parsed.allowed {
            if entry.ports.is_empty() {
                allowed.push(allowed_entry(&entry.ip_protocol, ""));
            }
            for port in &entry.ports {
                allowed.push(allowed_entry(&entry.ip_protocol, port));
            }
        }
        allowed.sort();
        let mut source_ranges = parsed.source_ranges;
        source_ranges.sort();

        Ok(Some(FirewallDescription {
            name: parsed.name,
            network: last_segment(&parsed.network),
            allowed,
            source_ranges,
        }))
    }

    async fn insert_firewall(&self, firewall: FirewallDescription) -> anyhow::Result<()> {
        let body = json!({
            "name": firewall.name,
            "network": format!("global/networks/{}", firewall.network),
            "allowed": allowed_json(&firewall.allowed),
            "sourceRanges": firewall.source_ranges,
        });
        self.send(self.http.post(self.global_url("firewalls")).json(&body))
            .await
            .context("insert firewall")?;
        Ok(())
    }

    async fn patch_firewall(&self, firewall: FirewallDescription) -> anyhow::Result<()> {
        let body = json!({
            "allowed": allowed_json(&firewall.allowed),
            "sourceRanges": firewall.source_ranges,
        });
        self.send(
            self.http
                .patch(self.global_url(&format!("firewalls/{}", firewall.name)))
                .json(&body),
        )
        .await
        .context("patch firewall")?;
        Ok(())
    }

    async fn delete_firewall(&self, name: &str) -> anyhow::Result<()> {
        self.send(
            self.http
                .delete(self.global_url(&format!("firewalls/{name}"))),
        )
        .await
        .context("delete firewall")?;
        Ok(())
    }

    async fn list_static_ips(&self) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "{API_BASE}/projects/{}/regions/{}/addresses",
            self.project,
            self.region()
        );
        let resp = self.send(self.http.get(url)).await.context("list addresses")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: AddressList = resp.json().await?;
        Ok(parsed.items.into_iter().map(|a| a.address).collect())
    }

    async fn add_access_config(&self, instance: &str, nat_ip: &str) -> anyhow::Result<()> {
        let mut body = json!({"type": "ONE_TO_ONE_NAT", "name": "External NAT"});
        if !nat_ip.is_empty() {
            body["natIP"] = json!(nat_ip);
        }
        let url = format!(
            "{}?networkInterface=nic0",
            self.zone_url(&format!("instances/{instance}/addAccessConfig"))
        );
        self.send(self.http.post(url).json(&body))
            .await
            .context("add access config")?;
        Ok(())
    }

    async fn delete_access_config(&self, instance: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}?accessConfig=External%20NAT&networkInterface=nic0",
            self.zone_url(&format!("instances/{instance}/deleteAccessConfig"))
        );
        self.send(self.http.post(url))
            .await
            .context("delete access config")?;
        Ok(())
    }
}
