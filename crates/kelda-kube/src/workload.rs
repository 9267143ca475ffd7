//! The workload reconciler: three name-keyed joins per tick.
//!
//! ConfigMaps and Secrets converge before Deployments, because pods
//! reference them; deletes run in the opposite order (Deployment first)
//! so a still-referenced object is never pulled out from under a pod.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kelda_db::{Conn, Table};
use kelda_join::hash_join;

use crate::client::{retry_on_conflict, ConfigMapsApi, DeploymentsApi, SecretsApi};
use crate::configmap::desired_config_maps;
use crate::deployment::desired_deployments;
use crate::secrets::{
    desired_secrets, is_managed_secret, referenced_secret_names, secret_value, SecretSource,
};

/// The API surfaces the workload reconciler writes to.
#[derive(Clone)]
pub struct WorkloadClients {
    pub deployments: Arc<dyn DeploymentsApi>,
    pub config_maps: Arc<dyn ConfigMapsApi>,
    pub secrets: Arc<dyn SecretsApi>,
}

/// Drive the cluster's workloads until shutdown. Wakes on a 60-second
/// tick or any write to the container, placement, leader, or image
/// tables.
pub async fn run_workloads(
    conn: Conn,
    clients: WorkloadClients,
    source: Arc<dyn SecretSource>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut trigger = conn.trigger_tick(
        60,
        &[Table::Container, Table::Placement, Table::Etcd, Table::Image],
    );
    loop {
        tokio::select! {
            event = trigger.recv() => {
                if event.is_none() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
        if !conn.etcd_leader() {
            continue;
        }
        run_workload_once(&conn, &clients, source.as_ref()).await;
    }
    info!("workload reconciler stopped");
}

/// One reconcile tick.
pub async fn run_workload_once(conn: &Conn, clients: &WorkloadClients, source: &dyn SecretSource) {
    let mut containers = Vec::new();
    let mut images = Vec::new();
    let mut placements = Vec::new();
    let _ = conn
        .txn(&[Table::Container, Table::Image, Table::Placement])
        .run(|view| {
            containers = view.containers();
            images = view.images();
            placements = view.placements();
            Ok(())
        });

    let mut resolved = HashMap::new();
    for name in referenced_secret_names(&containers) {
        match source.get(&name).await {
            Ok(Some(value)) => {
                resolved.insert(name, value);
            }
            Ok(None) => debug!(secret = %name, "secret not yet resolved"),
            Err(err) => warn!(secret = %name, error = %err, "failed to read secret"),
        }
    }

    // ── ConfigMaps: creates now, deletes after Deployments ─────────
    let current = match clients.config_maps.list().await {
        Ok(current) => current,
        Err(err) => {
            error!(error = %err, "failed to list current config maps");
            return;
        }
    };
    let config_maps = hash_join(
        desired_config_maps(&containers),
        current,
        config_map_name,
        config_map_name,
    );
    for config_map in &config_maps.left_only {
        let name = config_map_name(config_map);
        info!(config_map = %name, "creating config map");
        if let Err(err) = clients.config_maps.create(config_map).await {
            error!(config_map = %name, error = %err, "failed to create config map");
        }
    }

    // ── Secrets: creates and updates now, deletes after Deployments ─
    let current = match clients.secrets.list().await {
        Ok(current) => current,
        Err(err) => {
            error!(error = %err, "failed to list current secrets");
            return;
        }
    };
    let current: Vec<Secret> = current
        .into_iter()
        .filter(|s| is_managed_secret(&secret_name(s)))
        .collect();
    let secrets = hash_join(
        desired_secrets(&containers, &resolved),
        current,
        secret_name,
        secret_name,
    );
    for secret in &secrets.left_only {
        let name = secret_name(secret);
        info!(secret = %name, "creating secret");
        if let Err(err) = clients.secrets.create(secret).await {
            error!(secret = %name, error = %err, "failed to create secret");
        }
    }
    for (desired, current) in &secrets.pairs {
        if secret_value(desired) == secret_value(current) {
            continue;
        }
        let name = secret_name(desired);
        info!(secret = %name, "updating secret");
        let result = retry_on_conflict(|| async { clients.secrets.update(desired).await }).await;
        if let Err(err) = result {
            error!(secret = %name, error = %err, "failed to update secret");
        }
    }

    // ── Deployments ────────────────────────────────────────────────
    let current = match clients.deployments.list().await {
        Ok(current) => current,
        Err(err) => {
            error!(error = %err, "failed to list current deployments");
            return;
        }
    };
    let deployments = hash_join(
        desired_deployments(&containers, images, placements, resolved),
        current,
        deployment_name,
        deployment_name,
    );
    for (desired, current) in &deployments.pairs {
        if desired.spec == current.spec {
            continue;
        }
        let name = deployment_name(desired);
        let result =
            retry_on_conflict(|| async { clients.deployments.update(desired).await }).await;
        if let Err(err) = result {
            error!(deployment = %name, error = %err, "failed to update deployment");
        }
    }
    for deployment in &deployments.left_only {
        let name = deployment_name(deployment);
        info!(deployment = %name, "creating deployment");
        if let Err(err) = clients.deployments.create(deployment).await {
            error!(deployment = %name, error = %err, "failed to create deployment");
        }
    }
    for deployment in &deployments.right_only {
        let name = deployment_name(deployment);
        info!(deployment = %name, "deleting deployment");
        if let Err(err) = clients.deployments.delete(&name).await {
            error!(deployment = %name, error = %err, "failed to delete deployment");
        }
    }

    // ── Deferred deletes, now that no deployment references them ───
    for config_map in &config_maps.right_only {
        let name = config_map_name(config_map);
        info!(config_map = %name, "deleting config map");
        if let Err(err) = clients.config_maps.delete(&name).await {
            error!(config_map = %name, error = %err, "failed to delete config map");
        }
    }
    for secret in &secrets.right_only {
        let name = secret_name(secret);
        info!(secret = %name, "deleting secret");
        if let Err(err) = clients.secrets.delete(&name).await {
            error!(secret = %name, error = %err, "failed to delete secret");
        }
    }
}

fn deployment_name(deployment: &Deployment) -> String {
    deployment.metadata.name.clone().unwrap_or_default()
}

fn config_map_name(config_map: &ConfigMap) -> String {
    config_map.metadata.name.clone().unwrap_or_default()
}

fn secret_name(secret: &Secret) -> String {
    secret.metadata.name.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests;
