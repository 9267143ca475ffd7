//! The compiled blueprint document.
//!
//! A blueprint is the desired-state input to the controller: the set of
//! cloud machines, containers, connections, and placement rules the
//! deployment should converge to. The blueprint compiler (an external
//! collaborator) emits it as JSON; this crate holds the serde model plus
//! the `ContainerValue` string-or-secret union that env vars and container
//! files are expressed in.
//!
//! The enums for providers and machine roles also live here because every
//! layer of the control plane shares them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod value;

pub use value::ContainerValue;

/// The hostname blueprints use to refer to the public internet in
/// connection rules.
pub const PUBLIC_INTERNET: &str = "public";

/// Errors produced while parsing or validating a blueprint document.
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("failed to parse blueprint: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid blueprint: {0}")]
    Validation(String),
}

/// A cloud provider a machine can be requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum ProviderKind {
    #[default]
    Amazon,
    DigitalOcean,
    Google,
    Vagrant,
}

impl ProviderKind {
    /// All providers the controller knows how to drive.
    pub fn all() -> [ProviderKind; 4] {
        [
            ProviderKind::Amazon,
            ProviderKind::DigitalOcean,
            ProviderKind::Google,
            ProviderKind::Vagrant,
        ]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::Amazon => "Amazon",
            ProviderKind::DigitalOcean => "DigitalOcean",
            ProviderKind::Google => "Google",
            ProviderKind::Vagrant => "Vagrant",
        };
        f.write_str(s)
    }
}

/// The role a machine plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Role {
    #[default]
    #[serde(rename = "")]
    None,
    Master,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::None => "",
            Role::Master => "Master",
            Role::Worker => "Worker",
        };
        f.write_str(s)
    }
}

/// The top-level blueprint document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Blueprint {
    pub namespace: String,
    pub machines: Vec<Machine>,
    pub containers: Vec<Container>,
    pub load_balancers: Vec<LoadBalancer>,
    pub connections: Vec<Connection>,
    pub placements: Vec<Placement>,
    /// Invariant expressions are checked by the compiler; the controller
    /// carries them opaquely.
    pub invariants: Vec<serde_json::Value>,
}

/// A requested cloud machine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Machine {
    pub provider: ProviderKind,
    pub role: Role,
    pub region: String,
    pub size: String,
    pub disk_size: i32,
    pub preemptible: bool,
    pub floating_ip: String,
    pub ssh_keys: Vec<String>,
}

/// A requested container workload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub hostname: String,
    pub image: ImageSpec,
    pub command: Vec<String>,
    pub env: BTreeMap<String, ContainerValue>,
    pub filepath_to_content: BTreeMap<String, ContainerValue>,
}

/// The image a container runs: either a registry name, or a name plus a
/// Dockerfile for images the deployment builds itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSpec {
    Name(String),
    Custom {
        name: String,
        #[serde(default)]
        dockerfile: String,
    },
}

impl Default for ImageSpec {
    fn default() -> Self {
        ImageSpec::Name(String::new())
    }
}

impl ImageSpec {
    pub fn name(&self) -> &str {
        match self {
            ImageSpec::Name(name) => name,
            ImageSpec::Custom { name, .. } => name,
        }
    }

    /// The Dockerfile source, or "" for plain registry images.
    pub fn dockerfile(&self) -> &str {
        match self {
            ImageSpec::Name(_) => "",
            ImageSpec::Custom { dockerfile, .. } => dockerfile,
        }
    }
}

/// A named group of containers traffic can be balanced over.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancer {
    pub name: String,
    pub hostnames: Vec<String>,
}

/// An allowed network connection between groups of hostnames.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Connection {
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub min_port: u16,
    pub max_port: u16,
}

impl Connection {
    /// Whether this connection admits traffic from the public internet.
    pub fn from_public(&self) -> bool {
        self.from.iter().any(|h| h == PUBLIC_INTERNET)
    }
}

/// A placement rule constraining where a container may run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Placement {
    pub target_container: String,
    pub exclusive: bool,
    pub other_container: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
}

impl Blueprint {
    /// Parse and validate a blueprint from its JSON encoding.
    pub fn from_json(doc: &str) -> Result<Blueprint, BlueprintError> {
        let bp: Blueprint = serde_json::from_str(doc)?;
        bp.validate()?;
        Ok(bp)
    }

    fn validate(&self) -> Result<(), BlueprintError> {
        let mut seen = BTreeMap::new();
        for c in &self.containers {
            if c.hostname.is_empty() {
                return Err(BlueprintError::Validation(format!(
                    "container with image {:?} has no hostname",
                    c.image.name()
                )));
            }
            if seen.insert(c.hostname.clone(), ()).is_some() {
                return Err(BlueprintError::Validation(format!(
                    "duplicate container hostname {:?}",
                    c.hostname
                )));
            }
            for path in c.filepath_to_content.keys() {
                if !path.starts_with('/') {
                    return Err(BlueprintError::Validation(format!(
                        "container {:?} file path {:?} is not absolute",
                        c.hostname, path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Render a string map in a canonical, key-sorted form.
///
/// Hash inputs all over the controller go through this, so the encoding
/// must never change: two logically equal maps must produce identical
/// bytes on every process on every platform.
pub fn map_as_string(map: &BTreeMap<String, String>) -> String {
    let mut out = String::from("map[");
    for (ii, (k, v)) in map.iter().enumerate() {
        if ii > 0 {
            out.push(' ');
        }
        out.push_str(k);
        out.push(':');
        out.push_str(v);
    }
    out.push(']');
    out
}

/// Split a `ContainerValue` map into its raw strings and its secret
/// references (value = secret name).
pub fn divide_container_values(
    values: &BTreeMap<String, ContainerValue>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut raw = BTreeMap::new();
    let mut secrets = BTreeMap::new();
    for (key, val) in values {
        match val {
            ContainerValue::Literal(s) => {
                raw.insert(key.clone(), s.clone());
            }
            ContainerValue::Secret { name_of_secret } => {
                secrets.insert(key.clone(), name_of_secret.clone());
            }
        }
    }
    (raw, secrets)
}

/// The names of all secrets referenced by a container value map.
pub fn referenced_secrets(values: &BTreeMap<String, ContainerValue>) -> Vec<String> {
    let (_, secrets) = divide_container_values(values);
    let mut names: Vec<String> = secrets.into_values().collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_blueprint() {
        let bp = Blueprint::from_json(
            r#"{"namespace": "n1",
                "machines": [{"role": "Master", "provider": "Amazon",
                              "region": "us-west-1", "size": "m4.large"}]}"#,
        )
        .unwrap();
        assert_eq!(bp.namespace, "n1");
        assert_eq!(bp.machines.len(), 1);
        assert_eq!(bp.machines[0].role, Role::Master);
        assert_eq!(bp.machines[0].provider, ProviderKind::Amazon);
        assert!(bp.containers.is_empty());
    }

    #[test]
    fn parse_container_with_env() {
        let bp = Blueprint::from_json(
            r#"{"namespace": "n1",
                "containers": [{"hostname": "web", "image": "nginx",
                                "env": {"A": "1"}}]}"#,
        )
        .unwrap();
        let c = &bp.containers[0];
        assert_eq!(c.hostname, "web");
        assert_eq!(c.image.name(), "nginx");
        assert_eq!(c.image.dockerfile(), "");
        assert_eq!(
            c.env.get("A"),
            Some(&ContainerValue::Literal("1".to_string()))
        );
    }

    #[test]
    fn parse_custom_image() {
        let bp = Blueprint::from_json(
            r#"{"containers": [{"hostname": "built",
                "image": {"name": "custom", "dockerfile": "FROM alpine"}}]}"#,
        )
        .unwrap();
        let image = &bp.containers[0].image;
        assert_eq!(image.name(), "custom");
        assert_eq!(image.dockerfile(), "FROM alpine");
    }

    #[test]
    fn duplicate_hostname_rejected() {
        let err = Blueprint::from_json(
            r#"{"containers": [{"hostname": "a", "image": "x"},
                               {"hostname": "a", "image": "y"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BlueprintError::Validation(_)));
    }

    #[test]
    fn relative_file_path_rejected() {
        let err = Blueprint::from_json(
            r#"{"containers": [{"hostname": "a", "image": "x",
                "filepathToContent": {"etc/conf": "data"}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BlueprintError::Validation(_)));
    }

    #[test]
    fn map_as_string_is_key_sorted() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), "2".to_string());
        map.insert("a".to_string(), "1".to_string());
        assert_eq!(map_as_string(&map), "map[a:1 b:2]");
        assert_eq!(map_as_string(&BTreeMap::new()), "map[]");
    }

    #[test]
    fn divide_container_values_splits() {
        let mut values = BTreeMap::new();
        values.insert("raw".to_string(), ContainerValue::literal("v"));
        values.insert("sec".to_string(), ContainerValue::secret("token"));

        let (raw, secrets) = divide_container_values(&values);
        assert_eq!(raw.get("raw"), Some(&"v".to_string()));
        assert_eq!(secrets.get("sec"), Some(&"token".to_string()));
    }

    #[test]
    fn referenced_secrets_dedups() {
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), ContainerValue::secret("shared"));
        values.insert("b".to_string(), ContainerValue::secret("shared"));
        values.insert("c".to_string(), ContainerValue::secret("other"));
        assert_eq!(referenced_secrets(&values), vec!["other", "shared"]);
    }

    #[test]
    fn connection_from_public() {
        let conn = Connection {
            from: vec![PUBLIC_INTERNET.to_string()],
            to: vec!["web".to_string()],
            min_port: 80,
            max_port: 80,
        };
        assert!(conn.from_public());
    }
}
