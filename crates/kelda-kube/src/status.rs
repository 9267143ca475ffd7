//! The pod status updater.
//!
//! Runs off the pod watch stream rather than the reconcile timer: every
//! pod event triggers a full re-list, joined against container rows by
//! the `keldaIP` annotation. The annotation survives pod restarts, so a
//! container row re-finds its pod no matter how Kubernetes churns the
//! pod name.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::watch;
use tracing::{info, warn};

use kelda_db::{Conn, Container, Table};
use kelda_join::hash_join;

use crate::client::PodsApi;
use crate::deployment::KELDA_IP_KEY;

/// Mirror pod state into container rows until shutdown. The watch
/// stream is re-established if the apiserver drops it.
pub async fn run_pod_status(conn: Conn, pods: Arc<dyn PodsApi>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let mut events = match pods.watch_events().await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "failed to watch pods");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        loop {
            tokio::select! {
                event = events.next() => {
                    if event.is_none() {
                        break;
                    }
                    update_container_statuses(&conn, pods.as_ref()).await;
                }
                _ = shutdown.changed() => {
                    info!("pod status updater stopped");
                    return;
                }
            }
        }
    }
    info!("pod status updater stopped");
}

/// Re-read the full pod list and refresh status, pod id, minion, and
/// created timestamp on every container row.
pub async fn update_container_statuses(conn: &Conn, pods: &dyn PodsApi) {
    let pod_list = match pods.list().await {
        Ok(pods) => pods,
        Err(err) => {
            warn!(error = %err, "failed to list pods");
            return;
        }
    };

    let _ = conn.txn(&[Table::Container]).run(|view| {
        let joined = hash_join(view.containers(), pod_list, |c| c.ip.clone(), pod_ip);

        for (dbc, pod) in joined.pairs {
            let updated = Container {
                status: pod_status(&pod),
                pod_id: pod.metadata.name.clone().unwrap_or_default(),
                minion: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.host_ip.clone())
                    .unwrap_or_default(),
                created: pod_created(&pod),
                ..dbc.clone()
            };
            if updated != dbc {
                view.commit(updated);
            }
        }

        // A container whose pod vanished forgets what it knew.
        for dbc in joined.left_only {
            let cleared = Container {
                status: String::new(),
                pod_id: String::new(),
                minion: String::new(),
                created: None,
                ..dbc.clone()
            };
            if cleared != dbc {
                view.commit(cleared);
            }
        }
        Ok(())
    });
}

fn pod_ip(pod: &Pod) -> String {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(KELDA_IP_KEY))
        .cloned()
        .unwrap_or_default()
}

/// Human-readable status for a pod: the first container's state, or
/// `scheduled` when the pod exists but no container has reported yet.
fn pod_status(pod: &Pod) -> String {
    let first = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first());

    let Some(container) = first else {
        return "scheduled".to_string();
    };
    let Some(state) = &container.state else {
        return "scheduled".to_string();
    };

    if state.running.is_some() {
        return "running".to_string();
    }
    if let Some(waiting) = &state.waiting {
        return format!("waiting: {}", waiting.reason.clone().unwrap_or_default());
    }
    if let Some(terminated) = &state.terminated {
        return format!(
            "terminated: {}",
            terminated.reason.clone().unwrap_or_default()
        );
    }
    "scheduled".to_string()
}

fn pod_created(pod: &Pod) -> Option<u64> {
    let started = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?
        .running
        .as_ref()?
        .started_at
        .as_ref()?;
    u64::try_from(started.0.timestamp()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::client::KubeResult;

    #[derive(Default)]
    struct FakePods {
        pods: Mutex<Vec<Pod>>,
    }

    #[async_trait]
    impl PodsApi for FakePods {
        async fn list(&self) -> KubeResult<Vec<Pod>> {
            Ok(self.pods.lock().unwrap().clone())
        }

        async fn watch_events(&self) -> KubeResult<BoxStream<'static, ()>> {
            Ok(futures::stream::empty().boxed())
        }
    }

    fn pod(name: &str, kelda_ip: &str, state: Option<ContainerState>) -> Pod {
        let container_statuses = state.map(|state| {
            vec![ContainerStatus {
                state: Some(state),
                ..Default::default()
            }]
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    KELDA_IP_KEY.to_string(),
                    kelda_ip.to_string(),
                )])),
                ..Default::default()
            },
            status: Some(PodStatus {
                host_ip: Some("10.0.0.5".to_string()),
                container_statuses,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn running_state(epoch: i64) -> ContainerState {
        ContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(Time(Utc.timestamp_opt(epoch, 0).unwrap())),
            }),
            ..Default::default()
        }
    }

    fn seed_container(conn: &Conn, ip: &str) {
        conn.txn(&[Table::Container])
            .run(|view| {
                let mut dbc = view.insert_container();
                dbc.hostname = "web".to_string();
                dbc.ip = ip.to_string();
                view.commit(dbc);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn running_pod_fills_container_row() {
        let conn = Conn::new();
        seed_container(&conn, "10.1.0.1");
        let pods = FakePods::default();
        pods.pods
            .lock()
            .unwrap()
            .push(pod("web-abc", "10.1.0.1", Some(running_state(1000))));

        update_container_statuses(&conn, &pods).await;

        let dbc = conn.containers().remove(0);
        assert_eq!(dbc.status, "running");
        assert_eq!(dbc.pod_id, "web-abc");
        assert_eq!(dbc.minion, "10.0.0.5");
        assert_eq!(dbc.created, Some(1000));
    }

    #[tokio::test]
    async fn waiting_pod_reports_reason() {
        let conn = Conn::new();
        seed_container(&conn, "10.1.0.1");
        let state = ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ImagePullBackOff".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pods = FakePods::default();
        pods.pods
            .lock()
            .unwrap()
            .push(pod("web-abc", "10.1.0.1", Some(state)));

        update_container_statuses(&conn, &pods).await;
        assert_eq!(conn.containers()[0].status, "waiting: ImagePullBackOff");
    }

    #[tokio::test]
    async fn pod_without_container_status_is_scheduled() {
        let conn = Conn::new();
        seed_container(&conn, "10.1.0.1");
        let pods = FakePods::default();
        pods.pods.lock().unwrap().push(pod("web-abc", "10.1.0.1", None));

        update_container_statuses(&conn, &pods).await;
        assert_eq!(conn.containers()[0].status, "scheduled");
    }

    #[tokio::test]
    async fn vanished_pod_clears_the_row() {
        let conn = Conn::new();
        seed_container(&conn, "10.1.0.1");
        let pods = FakePods::default();
        pods.pods
            .lock()
            .unwrap()
            .push(pod("web-abc", "10.1.0.1", Some(running_state(1000))));
        update_container_statuses(&conn, &pods).await;

        pods.pods.lock().unwrap().clear();
        update_container_statuses(&conn, &pods).await;

        let dbc = conn.containers().remove(0);
        assert_eq!(dbc.status, "");
        assert_eq!(dbc.pod_id, "");
        assert_eq!(dbc.created, None);
    }

    #[tokio::test]
    async fn unrelated_pods_do_not_match() {
        let conn = Conn::new();
        seed_container(&conn, "10.1.0.1");
        let pods = FakePods::default();
        pods.pods
            .lock()
            .unwrap()
            .push(pod("other", "10.9.9.9", Some(running_state(1000))));

        update_container_statuses(&conn, &pods).await;
        assert_eq!(conn.containers()[0].status, "");
    }
}
