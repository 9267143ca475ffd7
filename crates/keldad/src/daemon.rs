//! Daemon startup and controller wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use kelda_cloud::{CloudConfig, StatusConfig};
use kelda_db::{import_blueprint, Conn, Table};
use kelda_kube::{DockerImageBuilder, KubeClients, KubeSecretSource, WorkloadClients};

/// A failure to reach an external endpoint at startup; mapped to exit
/// code 2 by main.
#[derive(Debug, Error)]
#[error("failed to connect: {0}")]
pub struct ConnectError(pub String);

pub struct DaemonOptions {
    pub blueprint: Option<PathBuf>,
    pub admin_cidrs: Vec<String>,
    pub kube_api: String,
    pub private_ip: String,
    pub registry: String,
}

/// Run the controller until interrupted.
pub async fn run(opts: DaemonOptions) -> anyhow::Result<()> {
    let conn = Conn::new();

    // Writes require leadership. The external leader lock is assumed to
    // be held by whoever started this process; non-leader replicas run
    // with leader=false and act as read-only mirrors.
    conn.txn(&[Table::Etcd]).run(|view| {
        let mut etcd = view.insert_etcd();
        etcd.leader = true;
        etcd.leader_ip = opts.private_ip.clone();
        view.commit(etcd);
        Ok(())
    })?;
    info!(leader_ip = %opts.private_ip, "assumed leadership");

    if let Some(path) = &opts.blueprint {
        let doc = std::fs::read_to_string(path)
            .with_context(|| format!("read blueprint {}", path.display()))?;
        let blueprint = kelda_blueprint::Blueprint::from_json(&doc)?;
        import_blueprint(&conn, &blueprint, &opts.admin_cidrs)?;
        info!(
            namespace = %blueprint.namespace,
            machines = blueprint.machines.len(),
            containers = blueprint.containers.len(),
            "blueprint imported"
        );
    }

    let kube = connect_kube(&opts.kube_api).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Controller tasks ───────────────────────────────────────────

    let cloud_handle = tokio::spawn(kelda_cloud::run(
        conn.clone(),
        CloudConfig::default(),
        shutdown_rx.clone(),
    ));

    let machine_status_handle = tokio::spawn(kelda_cloud::run_machine_status(
        conn.clone(),
        StatusConfig::default(),
        shutdown_rx.clone(),
    ));

    let workload_clients = WorkloadClients {
        deployments: kube.deployments.clone(),
        config_maps: kube.config_maps.clone(),
        secrets: kube.secrets.clone(),
    };
    let secret_source = Arc::new(KubeSecretSource {
        secrets: kube.secrets.clone(),
    });
    let workload_handle = tokio::spawn(kelda_kube::run_workloads(
        conn.clone(),
        workload_clients,
        secret_source,
        shutdown_rx.clone(),
    ));

    let pod_status_handle = tokio::spawn(kelda_kube::run_pod_status(
        conn.clone(),
        kube.pods.clone(),
        shutdown_rx.clone(),
    ));

    let node_label_handle = tokio::spawn(kelda_kube::run_node_labels(
        conn.clone(),
        kube.nodes.clone(),
        shutdown_rx.clone(),
    ));

    let image_handle = tokio::spawn(kelda_kube::run_image_builder(
        conn.clone(),
        Arc::new(DockerImageBuilder {
            registry: opts.registry.clone(),
        }),
        shutdown_rx,
    ));

    info!("controllers started");
    tokio::signal::ctrl_c().await.context("install signal handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = cloud_handle.await;
    let _ = machine_status_handle.await;
    let _ = workload_handle.await;
    let _ = pod_status_handle.await;
    let _ = node_label_handle.await;
    let _ = image_handle.await;

    info!("keldad stopped");
    Ok(())
}

/// Connect to the apiserver, retrying for a while before giving up.
/// This is the only fatal dependency: everything else degrades.
async fn connect_kube(api_server: &str) -> anyhow::Result<KubeClients> {
    for attempt in 1..=60u32 {
        match kelda_kube::connect(api_server).await {
            Ok(clients) => match clients.pods.list().await {
                Ok(_) => return Ok(clients),
                Err(err) => {
                    warn!(attempt, error = %err, "Kubernetes apiserver not ready");
                }
            },
            Err(err) => {
                warn!(attempt, error = %err, "failed to build Kubernetes client");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    Err(ConnectError(format!("Kubernetes apiserver at {api_server}")).into())
}
