//! The string-or-secret union used for env vars and container files.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A value handed to a container: either a raw string baked into the
/// blueprint, or a reference to a named secret resolved at deploy time.
///
/// On the wire the union is discriminated by shape — a JSON string is a
/// literal, an object with `nameOfSecret` is a secret reference:
///
/// ```text
/// "plain value"
/// {"nameOfSecret": "dbPassword"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContainerValue {
    Secret {
        #[serde(rename = "nameOfSecret")]
        name_of_secret: String,
    },
    Literal(String),
}

impl ContainerValue {
    pub fn literal(value: impl Into<String>) -> ContainerValue {
        ContainerValue::Literal(value.into())
    }

    pub fn secret(name: impl Into<String>) -> ContainerValue {
        ContainerValue::Secret {
            name_of_secret: name.into(),
        }
    }

    /// The secret name, if this value is a secret reference.
    pub fn secret_name(&self) -> Option<&str> {
        match self {
            ContainerValue::Secret { name_of_secret } => Some(name_of_secret),
            ContainerValue::Literal(_) => None,
        }
    }
}

/// The display form feeds the content hashes that detect changed values,
/// so it must stay stable: literals render as themselves, secret
/// references as `Secret: <name>`.
impl fmt::Display for ContainerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerValue::Literal(s) => f.write_str(s),
            ContainerValue::Secret { name_of_secret } => {
                write!(f, "Secret: {name_of_secret}")
            }
        }
    }
}
