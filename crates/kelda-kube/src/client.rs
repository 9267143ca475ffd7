//! Narrow clients over the Kubernetes API.
//!
//! Each resource the reconcilers touch gets its own small trait so tests
//! can substitute in-memory fakes; the real implementations are thin
//! wrappers over `kube::Api`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Api;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Errors from the Kubernetes clients. Conflicts get their own variant
/// because they're benign and retried locally.
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type KubeResult<T> = Result<T, KubeError>;

fn convert(err: kube::Error) -> KubeError {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 => KubeError::Conflict(resp.message.clone()),
        _ => KubeError::Other(err.into()),
    }
}

#[async_trait]
pub trait DeploymentsApi: Send + Sync {
    async fn list(&self) -> KubeResult<Vec<Deployment>>;
    async fn create(&self, deployment: &Deployment) -> KubeResult<()>;
    async fn update(&self, deployment: &Deployment) -> KubeResult<()>;
    async fn delete(&self, name: &str) -> KubeResult<()>;
}

#[async_trait]
pub trait ConfigMapsApi: Send + Sync {
    async fn list(&self) -> KubeResult<Vec<ConfigMap>>;
    async fn create(&self, config_map: &ConfigMap) -> KubeResult<()>;
    async fn delete(&self, name: &str) -> KubeResult<()>;
}

#[async_trait]
pub trait SecretsApi: Send + Sync {
    async fn list(&self) -> KubeResult<Vec<Secret>>;
    async fn get(&self, name: &str) -> KubeResult<Option<Secret>>;
    async fn create(&self, secret: &Secret) -> KubeResult<()>;
    async fn update(&self, secret: &Secret) -> KubeResult<()>;
    async fn delete(&self, name: &str) -> KubeResult<()>;
}

#[async_trait]
pub trait PodsApi: Send + Sync {
    async fn list(&self) -> KubeResult<Vec<Pod>>;
    /// An endless stream that yields on every pod change. Consumers
    /// re-list rather than interpreting individual events.
    async fn watch_events(&self) -> KubeResult<BoxStream<'static, ()>>;
}

/// A node as the label writer sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDescription {
    pub name: String,
    pub internal_ip: String,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait NodesApi: Send + Sync {
    async fn list(&self) -> KubeResult<Vec<NodeDescription>>;
    async fn set_labels(&self, name: &str, labels: BTreeMap<String, String>) -> KubeResult<()>;
}

/// Retry `attempt` on apiserver conflicts, up to 5 tries with doubling
/// delay. Conflicts are benign (usually a status-field race), so they
/// retry silently.
pub(crate) async fn retry_on_conflict<F, Fut>(mut attempt: F) -> KubeResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = KubeResult<()>>,
{
    let mut delay = Duration::from_millis(10);
    for _ in 0..4 {
        match attempt().await {
            Err(KubeError::Conflict(message)) => {
                debug!(%message, "retrying on conflict");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
    attempt().await
}

// ── Real clients ───────────────────────────────────────────────────

/// Handles on every API surface the controllers use.
#[derive(Clone)]
pub struct KubeClients {
    pub deployments: Arc<dyn DeploymentsApi>,
    pub config_maps: Arc<dyn ConfigMapsApi>,
    pub secrets: Arc<dyn SecretsApi>,
    pub pods: Arc<dyn PodsApi>,
    pub nodes: Arc<dyn NodesApi>,
}

/// Connect to the apiserver at `api_server` (e.g. `http://localhost:8080`).
pub async fn connect(api_server: &str) -> anyhow::Result<KubeClients> {
    let uri = api_server.parse::<http::Uri>()?;
    let config = kube::Config::new(uri);
    let client = kube::Client::try_from(config)?;

    Ok(KubeClients {
        deployments: Arc::new(KubeDeployments {
            api: Api::default_namespaced(client.clone()),
        }),
        config_maps: Arc::new(KubeConfigMaps {
            api: Api::default_namespaced(client.clone()),
        }),
        secrets: Arc::new(KubeSecrets {
            api: Api::default_namespaced(client.clone()),
        }),
        pods: Arc::new(KubePods {
            api: Api::default_namespaced(client.clone()),
        }),
        nodes: Arc::new(KubeNodes {
            api: Api::all(client),
        }),
    })
}

struct KubeDeployments {
    api: Api<Deployment>,
}

#[async_trait]
impl DeploymentsApi for KubeDeployments {
    async fn list(&self) -> KubeResult<Vec<Deployment>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(convert)?;
        Ok(list.items)
    }

    async fn create(&self, deployment: &Deployment) -> KubeResult<()> {
        self.api
            .create(&PostParams::default(), deployment)
            .await
            .map_err(convert)?;
        Ok(())
    }

    async fn update(&self, deployment: &Deployment) -> KubeResult<()> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        // Carry the live resourceVersion so a stale write surfaces as a
        // conflict instead of clobbering a concurrent update.
        let current = self.api.get(&name).await.map_err(convert)?;
        let mut desired = deployment.clone();
        desired.metadata.resource_version = current.metadata.resource_version;
        self.api
            .replace(&name, &PostParams::default(), &desired)
            .await
            .map_err(convert)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> KubeResult<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(convert)?;
        Ok(())
    }
}

struct KubeConfigMaps {
    api: Api<ConfigMap>,
}

#[async_trait]
impl ConfigMapsApi for KubeConfigMaps {
    async fn list(&self) -> KubeResult<Vec<ConfigMap>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(convert)?;
        Ok(list.items)
    }

    async fn create(&self, config_map: &ConfigMap) -> KubeResult<()> {
        self.api
            .create(&PostParams::default(), config_map)
            .await
            .map_err(convert)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> KubeResult<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(convert)?;
        Ok(())
    }
}

struct KubeSecrets {
    api: Api<Secret>,
}

#[async_trait]
impl SecretsApi for KubeSecrets {
    async fn list(&self) -> KubeResult<Vec<Secret>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(convert)?;
        Ok(list.items)
    }

    async fn get(&self, name: &str) -> KubeResult<Option<Secret>> {
        self.api.get_opt(name).await.map_err(convert)
    }

    async fn create(&self, secret: &Secret) -> KubeResult<()> {
        self.api
            .create(&PostParams::default(), secret)
            .await
            .map_err(convert)?;
        Ok(())
    }

    async fn update(&self, secret: &Secret) -> KubeResult<()> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let current = self.api.get(&name).await.map_err(convert)?;
        let mut desired = secret.clone();
        desired.metadata.resource_version = current.metadata.resource_version;
        self.api
            .replace(&name, &PostParams::default(), &desired)
            .await
            .map_err(convert)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> KubeResult<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(convert)?;
        Ok(())
    }
}

struct KubePods {
    api: Api<Pod>,
}

#[async_trait]
impl PodsApi for KubePods {
    async fn list(&self) -> KubeResult<Vec<Pod>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(convert)?;
        Ok(list.items)
    }

    async fn watch_events(&self) -> KubeResult<BoxStream<'static, ()>> {
        let stream = kube::runtime::watcher(
            self.api.clone(),
            kube::runtime::watcher::Config::default(),
        )
        .map(|_| ())
        .boxed();
        Ok(stream)
    }
}

struct KubeNodes {
    api: Api<Node>,
}

#[async_trait]
impl NodesApi for KubeNodes {
    async fn list(&self) -> KubeResult<Vec<NodeDescription>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(convert)?;

        Ok(list
            .items
            .into_iter()
            .map(|node| {
                let internal_ip = node
                    .status
                    .as_ref()
                    .and_then(|s| s.addresses.as_ref())
                    .and_then(|addrs| {
                        addrs
                            .iter()
                            .find(|a| a.type_ == "InternalIP")
                            .map(|a| a.address.clone())
                    })
                    .unwrap_or_default();
                NodeDescription {
                    name: node.metadata.name.unwrap_or_default(),
                    internal_ip,
                    labels: node.metadata.labels.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn set_labels(&self, name: &str, labels: BTreeMap<String, String>) -> KubeResult<()> {
        let patch = json!({"metadata": {"labels": labels}});
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(convert)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_on_conflict_eventually_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = retry_on_conflict(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(KubeError::Conflict("try again".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_on_conflict_gives_up_after_five_attempts() {
        let attempts = AtomicU32::new(0);
        let result = retry_on_conflict(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(KubeError::Conflict("still racing".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(KubeError::Conflict(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn retry_on_conflict_passes_through_other_errors() {
        let attempts = AtomicU32::new(0);
        let result = retry_on_conflict(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(KubeError::Other(anyhow::anyhow!("boom"))) }
        })
        .await;
        assert!(matches!(result, Err(KubeError::Other(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
