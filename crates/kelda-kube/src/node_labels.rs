//! The node label writer.
//!
//! Stamps each Kubernetes node with its machine's provider, region,
//! size, and floating IP so the node affinities produced from placement
//! rules have something to select on. Nodes are matched to machine rows
//! by private IP.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use kelda_db::{Conn, Machine, Table};

use crate::affinity::{FLOATING_IP_LABEL, PROVIDER_LABEL, REGION_LABEL, SIZE_LABEL};
use crate::client::NodesApi;

/// Keep node labels in sync until shutdown.
pub async fn run_node_labels(conn: Conn, nodes: Arc<dyn NodesApi>, mut shutdown: watch::Receiver<bool>) {
    let mut trigger = conn.trigger_tick(60, &[Table::Machine, Table::Etcd]);
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
        update_node_labels(&conn, nodes.as_ref()).await;
    }
    info!("node label writer stopped");
}

/// One label sync pass.
pub async fn update_node_labels(conn: &Conn, nodes: &dyn NodesApi) {
    let node_list = match nodes.list().await {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "failed to list nodes");
            return;
        }
    };
    let machines = conn.machines();

    for node in node_list {
        let Some(machine) = machines.iter().find(|m| m.private_ip == node.internal_ip) else {
            continue;
        };

        let desired = machine_labels(machine);
        let matches = desired
            .iter()
            .all(|(key, value)| node.labels.get(key) == Some(value));
        if matches {
            continue;
        }

        let mut labels = node.labels.clone();
        labels.extend(desired);
        info!(node = %node.name, "updating node labels");
        if let Err(err) = nodes.set_labels(&node.name, labels).await {
            warn!(node = %node.name, error = %err, "failed to set node labels");
        }
    }
}

fn machine_labels(machine: &Machine) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PROVIDER_LABEL.to_string(), machine.provider.to_string()),
        (REGION_LABEL.to_string(), machine.region.clone()),
        (SIZE_LABEL.to_string(), machine.size.clone()),
        (FLOATING_IP_LABEL.to_string(), machine.floating_ip.clone()),
    ])
}
