use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::*;
use crate::client::{KubeError, KubeResult};
use kelda_blueprint::ContainerValue;
use kelda_db::Container;

/// An in-memory apiserver double shared by all three API traits. Every
/// mutation is appended to an operation log so tests can assert both
/// what happened and in which order.
#[derive(Default)]
struct FakeKube {
    deployments: Mutex<Vec<Deployment>>,
    config_maps: Mutex<Vec<ConfigMap>>,
    secrets: Mutex<Vec<Secret>>,
    ops: Mutex<Vec<String>>,
}

impl FakeKube {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }
}

#[async_trait]
impl DeploymentsApi for FakeKube {
    async fn list(&self) -> KubeResult<Vec<Deployment>> {
        Ok(self.deployments.lock().unwrap().clone())
    }

    async fn create(&self, deployment: &Deployment) -> KubeResult<()> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("create deployment {}", deployment_name(deployment)));
        self.deployments.lock().unwrap().push(deployment.clone());
        Ok(())
    }

    async fn update(&self, deployment: &Deployment) -> KubeResult<()> {
        let name = deployment_name(deployment);
        self.ops
            .lock()
            .unwrap()
            .push(format!("update deployment {name}"));
        let mut deployments = self.deployments.lock().unwrap();
        match deployments.iter_mut().find(|d| deployment_name(d) == name) {
            Some(existing) => {
                *existing = deployment.clone();
                Ok(())
            }
            None => Err(KubeError::Other(anyhow::anyhow!("no deployment {name}"))),
        }
    }

    async fn delete(&self, name: &str) -> KubeResult<()> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("delete deployment {name}"));
        self.deployments
            .lock()
            .unwrap()
            .retain(|d| deployment_name(d) != name);
        Ok(())
    }
}

#[async_trait]
impl ConfigMapsApi for FakeKube {
    async fn list(&self) -> KubeResult<Vec<ConfigMap>> {
        Ok(self.config_maps.lock().unwrap().clone())
    }

    async fn create(&self, config_map: &ConfigMap) -> KubeResult<()> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("create configmap {}", config_map_name(config_map)));
        self.config_maps.lock().unwrap().push(config_map.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> KubeResult<()> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("delete configmap {name}"));
        self.config_maps
            .lock()
            .unwrap()
            .retain(|c| config_map_name(c) != name);
        Ok(())
    }
}

#[async_trait]
impl SecretsApi for FakeKube {
    async fn list(&self) -> KubeResult<Vec<Secret>> {
        Ok(self.secrets.lock().unwrap().clone())
    }

    async fn get(&self, name: &str) -> KubeResult<Option<Secret>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .iter()
            .find(|s| secret_name(s) == name)
            .cloned())
    }

    async fn create(&self, secret: &Secret) -> KubeResult<()> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("create secret {}", secret_name(secret)));
        self.secrets.lock().unwrap().push(secret.clone());
        Ok(())
    }

    async fn update(&self, secret: &Secret) -> KubeResult<()> {
        let name = secret_name(secret);
        self.ops.lock().unwrap().push(format!("update secret {name}"));
        let mut secrets = self.secrets.lock().unwrap();
        match secrets.iter_mut().find(|s| secret_name(s) == name) {
            Some(existing) => {
                *existing = secret.clone();
                Ok(())
            }
            None => Err(KubeError::Other(anyhow::anyhow!("no secret {name}"))),
        }
    }

    async fn delete(&self, name: &str) -> KubeResult<()> {
        self.ops.lock().unwrap().push(format!("delete secret {name}"));
        self.secrets
            .lock()
            .unwrap()
            .retain(|s| secret_name(s) != name);
        Ok(())
    }
}

/// A secret source over a plain map.
#[derive(Default)]
struct MapSource {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SecretSource for MapSource {
    async fn get(&self, name: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(name).cloned())
    }
}

fn harness() -> (Conn, Arc<FakeKube>, WorkloadClients, MapSource) {
    let conn = Conn::new();
    let fake = Arc::new(FakeKube::default());
    let clients = WorkloadClients {
        deployments: fake.clone(),
        config_maps: fake.clone(),
        secrets: fake.clone(),
    };
    (conn, fake, clients, MapSource::default())
}

fn add_container(conn: &Conn, hostname: &str, f: impl FnOnce(&mut Container)) {
    conn.txn(&[Table::Container])
        .run(|view| {
            let mut dbc = view.insert_container();
            dbc.hostname = hostname.to_string();
            dbc.image = "nginx".to_string();
            dbc.ip = format!("10.1.0.{}", dbc.id);
            f(&mut dbc);
            view.commit(dbc);
            Ok(())
        })
        .unwrap();
}

fn remove_container(conn: &Conn, hostname: &str) {
    conn.txn(&[Table::Container])
        .run(|view| {
            for dbc in view.containers() {
                if dbc.hostname == hostname {
                    view.remove(dbc);
                }
            }
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn creates_deployment_for_container() {
    let (conn, fake, clients, source) = harness();
    add_container(&conn, "web", |dbc| {
        dbc.env
            .insert("A".to_string(), ContainerValue::literal("1"));
    });

    run_workload_once(&conn, &clients, &source).await;

    let deployments = fake.deployments.lock().unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployment_name(&deployments[0]), "web");
    let pod = deployments[0]
        .spec
        .clone()
        .unwrap()
        .template
        .spec
        .unwrap();
    assert_eq!(pod.containers[0].image.as_deref(), Some("nginx"));
}

#[tokio::test]
async fn matching_cluster_means_zero_writes() {
    let (conn, fake, clients, source) = harness();
    add_container(&conn, "web", |dbc| {
        dbc.filepath_to_content
            .insert("/etc/a".to_string(), ContainerValue::literal("x"));
    });

    run_workload_once(&conn, &clients, &source).await;
    fake.clear_ops();

    run_workload_once(&conn, &clients, &source).await;
    assert!(fake.ops().is_empty(), "second tick wrote: {:?}", fake.ops());
}

#[tokio::test]
async fn identical_file_maps_share_one_config_map() {
    let (conn, fake, clients, source) = harness();
    for hostname in ["a", "b"] {
        add_container(&conn, hostname, |dbc| {
            dbc.filepath_to_content
                .insert("/etc/a".to_string(), ContainerValue::literal("x"));
        });
    }

    run_workload_once(&conn, &clients, &source).await;

    let config_maps = fake.config_maps.lock().unwrap();
    assert_eq!(config_maps.len(), 1);
    let shared = config_map_name(&config_maps[0]);

    // Both deployments mount the same ConfigMap.
    for deployment in fake.deployments.lock().unwrap().iter() {
        let pod = deployment.spec.clone().unwrap().template.spec.unwrap();
        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.config_map.as_ref().unwrap().name.as_deref(),
            Some(shared.as_str())
        );
    }
}

#[tokio::test]
async fn env_change_updates_in_place() {
    let (conn, fake, clients, source) = harness();
    add_container(&conn, "web", |dbc| {
        dbc.env
            .insert("A".to_string(), ContainerValue::literal("1"));
    });
    run_workload_once(&conn, &clients, &source).await;
    fake.clear_ops();

    conn.txn(&[Table::Container])
        .run(|view| {
            let mut dbc = view.containers().remove(0);
            dbc.env
                .insert("A".to_string(), ContainerValue::literal("2"));
            view.commit(dbc);
            Ok(())
        })
        .unwrap();
    run_workload_once(&conn, &clients, &source).await;

    assert_eq!(fake.ops(), vec!["update deployment web".to_string()]);
}

#[tokio::test]
async fn removed_container_deletes_deployment_before_config_map() {
    let (conn, fake, clients, source) = harness();
    add_container(&conn, "web", |dbc| {
        dbc.filepath_to_content
            .insert("/etc/a".to_string(), ContainerValue::literal("x"));
    });
    run_workload_once(&conn, &clients, &source).await;
    fake.clear_ops();

    remove_container(&conn, "web");
    run_workload_once(&conn, &clients, &source).await;

    let ops = fake.ops();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0], "delete deployment web");
    assert!(ops[1].starts_with("delete configmap"));
    assert!(fake.deployments.lock().unwrap().is_empty());
    assert!(fake.config_maps.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unresolved_secret_gates_deployment_until_available() {
    let (conn, fake, clients, source) = harness();
    add_container(&conn, "web", |dbc| {
        dbc.env
            .insert("TOKEN".to_string(), ContainerValue::secret("db-pass"));
    });

    run_workload_once(&conn, &clients, &source).await;
    assert!(fake.deployments.lock().unwrap().is_empty());
    assert!(fake.secrets.lock().unwrap().is_empty());

    source
        .values
        .lock()
        .unwrap()
        .insert("db-pass".to_string(), "hunter2".to_string());
    run_workload_once(&conn, &clients, &source).await;

    // The secret materializes before the deployment that references it.
    let ops = fake.ops();
    assert_eq!(
        ops,
        vec![
            "create secret kelda-secret-db-pass".to_string(),
            "create deployment web".to_string(),
        ]
    );
}

#[tokio::test]
async fn rotated_secret_value_is_updated() {
    let (conn, fake, clients, source) = harness();
    add_container(&conn, "web", |dbc| {
        dbc.env
            .insert("TOKEN".to_string(), ContainerValue::secret("db-pass"));
    });
    source
        .values
        .lock()
        .unwrap()
        .insert("db-pass".to_string(), "v1".to_string());
    run_workload_once(&conn, &clients, &source).await;
    fake.clear_ops();

    source
        .values
        .lock()
        .unwrap()
        .insert("db-pass".to_string(), "v2".to_string());
    run_workload_once(&conn, &clients, &source).await;

    let ops = fake.ops();
    // The secret is updated, and the SECRET_HASH env var change updates
    // the deployment to restart the pod.
    assert!(ops.contains(&"update secret kelda-secret-db-pass".to_string()));
    assert!(ops.contains(&"update deployment web".to_string()));
}

#[tokio::test]
async fn foreign_secrets_are_left_alone() {
    let (conn, fake, clients, source) = harness();
    fake.secrets.lock().unwrap().push(Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("default-token-abc".to_string()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(
            "token".to_string(),
            "xyz".to_string(),
        )])),
        ..Default::default()
    });

    run_workload_once(&conn, &clients, &source).await;
    assert_eq!(fake.secrets.lock().unwrap().len(), 1);
    assert!(fake.ops().is_empty());
}
