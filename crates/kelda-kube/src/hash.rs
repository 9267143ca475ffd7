//! Content hashing for object names and change-detection annotations.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use kelda_blueprint::{map_as_string, ContainerValue};

/// Hex SHA-1 of a string.
pub(crate) fn hash_str(s: &str) -> String {
    hex::encode(Sha1::digest(s.as_bytes()))
}

/// Hex SHA-1 of a plain string map, via its canonical rendering.
pub(crate) fn hash_string_map(map: &BTreeMap<String, String>) -> String {
    hash_str(&map_as_string(map))
}

/// Hex SHA-1 of a container value map. Secret references hash their
/// display form, so swapping a literal for a secret of the same text
/// still changes the hash.
pub(crate) fn hash_container_value_map(map: &BTreeMap<String, ContainerValue>) -> String {
    let rendered: BTreeMap<String, String> = map
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    hash_string_map(&rendered)
}
