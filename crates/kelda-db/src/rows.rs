//! Row and table definitions for the state store.
//!
//! Every entity the controller reasons about is a row in a typed table.
//! Rows carry a stable integer id assigned on insert and relate to each
//! other by logical key (hostname, cloud id) — never by pointer — so the
//! store can be snapshotted and diffed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use kelda_blueprint::{Blueprint as BlueprintSpec, ContainerValue, ProviderKind, Role};

/// Stable row identifier, unique across all tables of one store.
pub type RowId = u32;

/// The tables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Machine,
    Container,
    Image,
    Placement,
    Acl,
    Blueprint,
    Etcd,
    Minion,
}

impl Table {
    pub fn all() -> [Table; 8] {
        [
            Table::Machine,
            Table::Container,
            Table::Image,
            Table::Placement,
            Table::Acl,
            Table::Blueprint,
            Table::Etcd,
            Table::Minion,
        ]
    }
}

/// Machine lifecycle statuses written by the cloud reconciler and the
/// status updater.
pub mod status {
    pub const BOOTING: &str = "booting";
    pub const CONNECTING: &str = "connecting";
    pub const CONNECTED: &str = "connected";
    pub const RECONNECTING: &str = "reconnecting";
    pub const STOPPING: &str = "stopping";
}

/// A requested or observed cloud VM.
///
/// Rows are created by the blueprint importer; the cloud reconciler fills
/// in `cloud_id` and the IP fields as the provider reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: RowId,
    pub provider: ProviderKind,
    pub region: String,
    pub size: String,
    pub disk_size: i32,
    pub preemptible: bool,
    pub role: Role,
    pub public_ip: String,
    pub private_ip: String,
    pub floating_ip: String,
    /// Provider-assigned identifier; set iff the provider's most recent
    /// list reported the machine.
    pub cloud_id: String,
    pub ssh_keys: Vec<String>,
    pub status: String,
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Machine-{}{{{}, {} {}, {}}}",
            self.id, self.role, self.provider, self.region, self.size
        )
    }
}

/// A requested container workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: RowId,
    /// Unique within the blueprint.
    pub hostname: String,
    pub image: String,
    /// Dockerfile source for custom-built images, "" otherwise.
    pub dockerfile: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, ContainerValue>,
    pub filepath_to_content: BTreeMap<String, ContainerValue>,
    /// Blueprint-assigned IP, "" until allocated.
    pub ip: String,
    /// Name of the Kubernetes pod backing this container.
    pub pod_id: String,
    /// Private IP of the worker the pod landed on.
    pub minion: String,
    pub status: String,
    /// Unix seconds when the pod's container started, if it has.
    pub created: Option<u64>,
}

/// Build progress of a custom image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    #[default]
    Queued,
    Building,
    Built,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Building => "building",
            ImageStatus::Built => "built",
        };
        f.write_str(s)
    }
}

/// A custom-built image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: RowId,
    pub name: String,
    pub dockerfile: String,
    pub status: ImageStatus,
    /// Content-addressed digest of the pushed image, set once built.
    pub repo_digest: String,
}

/// A declarative placement rule for one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: RowId,
    pub target_container: String,
    pub exclusive: bool,
    pub other_container: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
}

/// An inclusive TCP/UDP port range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min_port: u16,
    pub max_port: u16,
}

/// The firewall policy: admin CIDRs with full access plus application
/// port ranges open to the world. Singleton.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acl {
    pub id: RowId,
    pub admin: Vec<String>,
    pub application_ports: Vec<PortRange>,
}

/// The parsed blueprint currently being reconciled. Singleton.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: RowId,
    pub spec: BlueprintSpec,
}

impl Blueprint {
    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }
}

/// Leader bookkeeping for this controller process. Singleton.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Etcd {
    pub id: RowId,
    /// Private IP of the current leader.
    pub leader_ip: String,
    /// Whether the local process is the leader.
    pub leader: bool,
}

/// A worker host participating in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Minion {
    pub id: RowId,
    /// Whether this row describes the local host.
    pub is_self: bool,
    pub private_ip: String,
    pub role: Role,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
    pub supervisor_init: bool,
}

/// A tagged row of any table.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Machine(Machine),
    Container(Container),
    Image(Image),
    Placement(Placement),
    Acl(Acl),
    Blueprint(Blueprint),
    Etcd(Etcd),
    Minion(Minion),
}

impl Row {
    pub fn id(&self) -> RowId {
        match self {
            Row::Machine(r) => r.id,
            Row::Container(r) => r.id,
            Row::Image(r) => r.id,
            Row::Placement(r) => r.id,
            Row::Acl(r) => r.id,
            Row::Blueprint(r) => r.id,
            Row::Etcd(r) => r.id,
            Row::Minion(r) => r.id,
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Row::Machine(_) => Table::Machine,
            Row::Container(_) => Table::Container,
            Row::Image(_) => Table::Image,
            Row::Placement(_) => Table::Placement,
            Row::Acl(_) => Table::Acl,
            Row::Blueprint(_) => Table::Blueprint,
            Row::Etcd(_) => Table::Etcd,
            Row::Minion(_) => Table::Minion,
        }
    }
}

macro_rules! row_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for Row {
            fn from(r: $ty) -> Row {
                Row::$variant(r)
            }
        })*
    };
}

row_from! {
    Machine => Machine,
    Container => Container,
    Image => Image,
    Placement => Placement,
    Acl => Acl,
    Blueprint => Blueprint,
    Etcd => Etcd,
    Minion => Minion,
}
