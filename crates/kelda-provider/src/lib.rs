//! Uniform adapters over the supported cloud providers.
//!
//! Each adapter exposes the same five operations — list, boot, stop,
//! set-ACLs, update-floating-IPs — plus cleanup of the namespaced network
//! scaffolding it lazily creates. One adapter instance serves one
//! (provider, region) pair.
//!
//! Adapters split into diff/translation logic and a narrow client trait
//! over the provider's API; the real clients live in each adapter's
//! `client` module and tests substitute recording doubles.

pub mod amazon;
mod cfg;
pub mod digitalocean;
mod error;
pub mod google;
mod types;
pub mod vagrant;

use async_trait::async_trait;

pub use cfg::cloud_config;
pub use error::{ProviderError, ProviderResult};
pub use types::{Acl, Machine};

use kelda_blueprint::ProviderKind;

/// The tag key marking cloud resources managed for a namespace.
pub fn namespace_tag(namespace: &str) -> String {
    format!("kelda-{}", namespace.to_lowercase())
}

/// The uniform provider interface the cloud reconciler drives.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The machines currently running in this provider/region under our
    /// namespace, annotated with cloud ids, sizes, and IPs.
    async fn list(&self) -> ProviderResult<Vec<Machine>>;

    /// Request new VMs matching `machines`. Returns the provider-assigned
    /// ids of the requests. The caller must not re-invoke on the same
    /// desired set — booted machines only become visible through `list`.
    async fn boot(&self, machines: Vec<Machine>) -> ProviderResult<Vec<String>>;

    /// Terminate machines by cloud id. A partial failure terminates what
    /// it can and reports a combined error.
    async fn stop(&self, machines: Vec<Machine>) -> ProviderResult<()>;

    /// Converge the provider firewall to exactly `acls` (plus the
    /// implicit intra-subnet rule): missing rules are added, extras
    /// revoked.
    async fn set_acls(&self, acls: Vec<Acl>) -> ProviderResult<()>;

    /// Associate each machine with its desired floating IP, and
    /// disassociate machines whose desired floating IP is empty.
    async fn update_floating_ips(&self, machines: Vec<Machine>) -> ProviderResult<()>;

    /// Delete the namespaced scaffolding this adapter created. Intended
    /// for when no machines are running or expected.
    async fn cleanup(&self) -> ProviderResult<()>;
}

/// The regions a provider may be driven in.
pub fn valid_regions(kind: ProviderKind) -> Vec<String> {
    let regions: &[&str] = match kind {
        ProviderKind::Amazon => amazon::REGIONS,
        ProviderKind::DigitalOcean => digitalocean::REGIONS,
        ProviderKind::Google => google::ZONES,
        // The local provider has no regions.
        ProviderKind::Vagrant => &[""],
    };
    regions.iter().map(|r| r.to_string()).collect()
}

/// Construct the real adapter for a (provider, region) pair.
pub async fn new_provider(
    kind: ProviderKind,
    namespace: &str,
    region: &str,
) -> ProviderResult<Box<dyn Provider>> {
    match kind {
        ProviderKind::Amazon => Ok(Box::new(amazon::Amazon::new(namespace, region).await?)),
        ProviderKind::DigitalOcean => {
            Ok(Box::new(digitalocean::DigitalOcean::new(namespace, region)?))
        }
        ProviderKind::Google => Ok(Box::new(google::Google::new(namespace, region).await?)),
        ProviderKind::Vagrant => Ok(Box::new(vagrant::Vagrant::new(namespace)?)),
    }
}
