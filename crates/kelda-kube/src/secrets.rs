//! Secret naming and resolution.
//!
//! Blueprint secrets are referenced by friendly name; in the cluster
//! they live as Kubernetes Secrets named `kelda-secret-<name>` with a
//! single `value` item. The reconciler resolves values through a
//! `SecretSource` — the default source is the cluster's own secret
//! store, so a secret written once (by the operator tooling) gates the
//! deployments that reference it until it exists.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kelda_db::Container;

use crate::client::SecretsApi;

const SECRET_PREFIX: &str = "kelda-secret-";

/// The key under which the secret value is stored in the Kubernetes
/// Secret, and the sub-path secret volumes mount.
pub(crate) const SECRET_ITEM_KEY: &str = "value";

/// The Kubernetes Secret name for a friendly secret name.
pub fn kube_secret_name(name: &str) -> String {
    format!("{SECRET_PREFIX}{name}")
}

/// Whether a Kubernetes Secret name is one of ours.
pub(crate) fn is_managed_secret(kube_name: &str) -> bool {
    kube_name.starts_with(SECRET_PREFIX)
}

/// Where secret values come from.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// The value for a friendly secret name, or `None` while unresolved.
    async fn get(&self, name: &str) -> anyhow::Result<Option<String>>;
}

/// The default source: read back from the cluster's secret store.
pub struct KubeSecretSource {
    pub secrets: Arc<dyn SecretsApi>,
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn get(&self, name: &str) -> anyhow::Result<Option<String>> {
        let secret = self
            .secrets
            .get(&kube_secret_name(name))
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(secret.as_ref().and_then(secret_value))
    }
}

/// Extract the stored value from a Kubernetes Secret, whether it came
/// back base64-encoded (`data`) or plain (`string_data`).
pub(crate) fn secret_value(secret: &Secret) -> Option<String> {
    if let Some(string_data) = &secret.string_data {
        if let Some(value) = string_data.get(SECRET_ITEM_KEY) {
            return Some(value.clone());
        }
    }
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(SECRET_ITEM_KEY))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).to_string())
}

/// Every secret name referenced by any container's env or file map.
pub(crate) fn referenced_secret_names(containers: &[Container]) -> Vec<String> {
    let mut names = Vec::new();
    for dbc in containers {
        names.extend(kelda_blueprint::referenced_secrets(&dbc.env));
        names.extend(kelda_blueprint::referenced_secrets(
            &dbc.filepath_to_content,
        ));
    }
    names.sort();
    names.dedup();
    names
}

/// The Kubernetes Secret objects the cluster should hold: one per
/// referenced secret whose value has resolved.
pub fn desired_secrets(
    containers: &[Container],
    resolved: &HashMap<String, String>,
) -> Vec<Secret> {
    referenced_secret_names(containers)
        .into_iter()
        .filter_map(|name| {
            let value = resolved.get(&name)?;
            let mut string_data = BTreeMap::new();
            string_data.insert(SECRET_ITEM_KEY.to_string(), value.clone());
            Some(Secret {
                metadata: ObjectMeta {
                    name: Some(kube_secret_name(&name)),
                    ..Default::default()
                },
                string_data: Some(string_data),
                type_: Some("Opaque".to_string()),
                ..Default::default()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kelda_blueprint::ContainerValue;

    fn container_with_secret_env(name: &str) -> Container {
        let mut env = BTreeMap::new();
        env.insert("TOKEN".to_string(), ContainerValue::secret(name));
        Container {
            env,
            ..Default::default()
        }
    }

    #[test]
    fn kube_names_are_prefixed() {
        assert_eq!(kube_secret_name("db"), "kelda-secret-db");
        assert!(is_managed_secret("kelda-secret-db"));
        assert!(!is_managed_secret("default-token-abc"));
    }

    #[test]
    fn referenced_names_span_env_and_files() {
        let mut dbc = container_with_secret_env("a");
        dbc.filepath_to_content.insert(
            "/etc/token".to_string(),
            ContainerValue::secret("b"),
        );
        let names = referenced_secret_names(&[dbc, container_with_secret_env("a")]);
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unresolved_secrets_are_omitted() {
        let containers = vec![container_with_secret_env("missing")];
        assert!(desired_secrets(&containers, &HashMap::new()).is_empty());

        let mut resolved = HashMap::new();
        resolved.insert("missing".to_string(), "now-present".to_string());
        let secrets = desired_secrets(&containers, &resolved);
        assert_eq!(secrets.len(), 1);
        assert_eq!(
            secrets[0].metadata.name.as_deref(),
            Some("kelda-secret-missing")
        );
        assert_eq!(secret_value(&secrets[0]).as_deref(), Some("now-present"));
    }
}
