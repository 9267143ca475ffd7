//! The real DigitalOcean REST client.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{
    DoClient, DropletDescription, DropletRequest, FirewallDescription, FirewallRule,
    FloatingIpDescription,
};

const API_BASE: &str = "https://api.digitalocean.com/v2";

/// DigitalOcean client authenticated with a personal access token.
pub struct HttpDoClient {
    http: reqwest::Client,
    token: String,
    base: String,
}

impl HttpDoClient {
    pub fn new(token: &str) -> HttpDoClient {
        HttpDoClient {
            http: reqwest::Client::new(),
            token: token.to_string(),
            base: API_BASE.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
    }

    async fn expect_success(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("DigitalOcean API error {status}: {body}"))
    }
}

#[derive(Deserialize)]
struct Network {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct Droplet {
    id: i64,
    size_slug: String,
    networks: Networks,
}

#[derive(Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<Network>,
}

impl Droplet {
    fn ip(&self, kind: &str) -> String {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == kind)
            .map(|n| n.ip_address.clone())
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct DropletsResponse {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Deserialize)]
struct CreateDropletResponse {
    droplet: DropletId,
}

#[derive(Deserialize)]
struct DropletId {
    id: i64,
}

#[derive(Deserialize)]
struct FloatingIp {
    ip: String,
    droplet: Option<DropletId>,
}

#[derive(Deserialize)]
struct FloatingIpsResponse {
    #[serde(default)]
    floating_ips: Vec<FloatingIp>,
}

#[derive(Deserialize)]
struct FirewallSource {
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Deserialize)]
struct InboundRule {
    protocol: String,
    #[serde(default)]
    ports: String,
    sources: FirewallSource,
}

#[derive(Deserialize)]
struct Firewall {
    id: String,
    name: String,
    #[serde(default)]
    inbound_rules: Vec<InboundRule>,
}

#[derive(Deserialize)]
struct FirewallsResponse {
    #[serde(default)]
    firewalls: Vec<Firewall>,
}

#[derive(Deserialize)]
struct CreateFirewallResponse {
    firewall: Firewall,
}

fn rule_json(rule: &FirewallRule) -> serde_json::Value {
    let mut value = json!({
        "protocol": rule.protocol,
        "sources": {"addresses": [rule.source]},
    });
    if !rule.ports.is_empty() {
        value["ports"] = json!(rule.ports);
    }
    value
}

fn flatten_rules(rules: Vec<InboundRule>) -> Vec<FirewallRule> {
    let mut out = Vec::new();
    for rule in rules {
        for source in rule.sources.addresses {
            out.push(FirewallRule {
                protocol: rule.protocol.clone(),
                ports: rule.ports.clone(),
                source,
            });
        }
    }
    out
}

#[async_trait]
impl DoClient for HttpDoClient {
    async fn list_droplets(&self, tag: &str) -> anyhow::Result<Vec<DropletDescription>> {
        let resp = self
            .request(reqwest::Method::GET, "/droplets")
            .query(&[("tag_name", tag), ("per_page", "200")])
            .send()
            .await
            .context("list droplets")?;
        let parsed: DropletsResponse = Self::expect_success(resp).await?.json().await?;

        Ok(parsed
            .droplets
            .into_iter()
            .map(|d| DropletDescription {
                id: d.id,
                public_ip: d.ip("public"),
                private_ip: d.ip("private"),
                size: d.size_slug,
            })
            .collect())
    }

    async fn create_droplet(&self, req: DropletRequest) -> anyhow::Result<i64> {
        let body = json!({
            "name": req.name,
            "region": req.region,
            "size": req.size,
            "image": "ubuntu-16-04-x64",
            "user_data": req.user_data,
            "private_networking": true,
            "tags": req.tags,
        });
        let resp = self
            .request(reqwest::Method::POST, "/droplets")
            .json(&body)
            .send()
            .await
            .context("create droplet")?;
        let parsed: CreateDropletResponse = Self::expect_success(resp).await?.json().await?;
        Ok(parsed.droplet.id)
    }

    async fn delete_droplet(&self, id: i64) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/droplets/{id}"))
            .send()
            .await
            .context("delete droplet")?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn list_floating_ips(&self) -> anyhow::Result<Vec<FloatingIpDescription>> {
        let resp = self
            .request(reqwest::Method::GET, "/floating_ips")
            .query(&[("per_page", "200")])
            .send()
            .await
            .context("list floating ips")?;
        let parsed: FloatingIpsResponse = Self::expect_success(resp).await?.json().await?;

        Ok(parsed
            .floating_ips
            .into_iter()
            .map(|f| FloatingIpDescription {
                ip: f.ip,
                droplet_id: f.droplet.map(|d| d.id),
            })
            .collect())
    }

    async fn assign_floating_ip(&self, ip: &str, droplet_id: i64) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/floating_ips/{ip}/actions"))
            .json(&json!({"type": "assign", "droplet_id": droplet_id}))
            .send()
            .await
            .context("assign floating ip")?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn unassign_floating_ip(&self, ip: &str) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/floating_ips/{ip}/actions"))
            .json(&json!({"type": "unassign"}))
            .send()
            .await
            .context("unassign floating ip")?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn get_firewall(&self, name: &str) -> anyhow::Result<Option<FirewallDescription>> {
        let resp = self
            .request(reqwest::Method::GET, "/firewalls")
            .query(&[("per_page", "200")])
            .send()
            .await
            .context("list firewalls")?;
        let parsed: FirewallsResponse = Self::expect_success(resp).await?.json().await?;

        Ok(parsed
            .firewalls
            .into_iter()
            .find(|f| f.name == name)
            .map(|f| FirewallDescription {
                id: f.id,
                inbound: flatten_rules(f.inbound_rules),
            }))
    }

    async fn create_firewall(
        &self,
        name: &str,
        tag: &str,
        rules: Vec<FirewallRule>,
    ) -> anyhow::Result<String> {
        let body = json!({
            "name": name,
            "inbound_rules": rules.iter().map(rule_json).collect::<Vec<_>>(),
            "outbound_rules": [
                {"protocol": "tcp", "ports": "all",
                 "destinations": {"addresses": ["0.0.0.0/0", "::/0"]}},
                {"protocol": "udp", "ports": "all",
                 "destinations": {"addresses": ["0.0.0.0/0", "::/0"]}},
                {"protocol": "icmp",
                 "destinations": {"addresses": ["0.0.0.0/0", "::/0"]}},
            ],
            "tags": [tag],
        });
        let resp = self
            .request(reqwest::Method::POST, "/firewalls")
            .json(&body)
            .send()
            .await
            .context("create firewall")?;
        let parsed: CreateFirewallResponse = Self::expect_success(resp).await?.json().await?;
        Ok(parsed.firewall.id)
    }

    async fn add_firewall_rules(&self, id: &str, rules: Vec<FirewallRule>) -> anyhow::Result<()> {
        let body = json!({"inbound_rules": rules.iter().map(rule_json).collect::<Vec<_>>()});
        let resp = self
            .request(reqwest::Method::POST, &format!("/firewalls/{id}/rules"))
            .json(&body)
            .send()
            .await
            .context("add firewall rules")?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn remove_firewall_rules(
        &self,
        id: &str,
        rules: Vec<FirewallRule>,
    ) -> anyhow::Result<()> {
        let body = json!({"inbound_rules": rules.iter().map(rule_json).collect::<Vec<_>>()});
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/firewalls/{id}/rules"))
            .json(&body)
            .send()
            .await
            .context("remove firewall rules")?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn delete_firewall(&self, id: &str) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/firewalls/{id}"))
            .send()
            .await
            .context("delete firewall")?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn create_tag(&self, name: &str) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/tags")
            .json(&json!({"name": name}))
            .send()
            .await
            .context("create tag")?;
        // 422 means the tag already exists, which is fine.
        if resp.status() == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(());
        }
        Self::expect_success(resp).await?;
        Ok(())
    }
}
