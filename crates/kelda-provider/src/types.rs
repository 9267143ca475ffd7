//! Machine and firewall descriptions exchanged with provider adapters.

use kelda_blueprint::Role;

/// A VM as a provider adapter sees it: requested attributes on the way
/// in (boot), observed attributes on the way out (list).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Machine {
    /// Provider-assigned identifier; "" on boot requests.
    pub cloud_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub floating_ip: String,
    pub size: String,
    /// Root disk size in GiB; 0 when the provider didn't report it.
    pub disk_size: i32,
    pub preemptible: bool,
    pub ssh_keys: Vec<String>,
    /// Only meaningful on boot requests, where it selects the cloud
    /// config the machine starts with.
    pub role: Role,
}

/// One firewall rule: a CIDR range allowed to reach an inclusive port
/// range over TCP and UDP.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Acl {
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl Acl {
    /// A rule admitting `cidr` on every port.
    pub fn allow_all(cidr: impl Into<String>) -> Acl {
        Acl {
            cidr_ip: cidr.into(),
            min_port: 1,
            max_port: 65535,
        }
    }
}
