//! The machine-status writer.
//!
//! Derives each machine row's lifecycle status from what the cloud
//! reconciler has learned (cloud id, public IP) and from minion
//! connectivity. Runs off its own trigger so status strings stay fresh
//! even when the reconciler has nothing to do.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use kelda_db::{status, Conn, Machine, Table};

/// Injected connectivity source for the status writer.
#[derive(Clone)]
pub struct StatusConfig {
    /// Whether the minion at the given public IP is currently reachable.
    /// The real feed comes from the control agents on the machines; the
    /// default reports nothing reachable.
    pub is_connected: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            is_connected: Arc::new(|_| false),
        }
    }
}

/// Refresh machine statuses until shutdown.
pub async fn run_machine_status(conn: Conn, cfg: StatusConfig, mut shutdown: watch::Receiver<bool>) {
    let mut trigger = conn.trigger_tick(30, &[Table::Machine]);
    loop {
        tokio::select! {
            event = trigger.recv() => {
                if event.is_none() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
        write_statuses(&conn, &cfg);
    }
    info!("machine status writer stopped");
}

fn write_statuses(conn: &Conn, cfg: &StatusConfig) {
    let _ = conn.txn(&[Table::Machine]).run(|view| {
        for mut m in view.machines() {
            let connected = !m.public_ip.is_empty() && (cfg.is_connected)(&m.public_ip);
            if let Some(next) = machine_status(&m, connected) {
                if m.status != next {
                    m.status = next.to_string();
                    view.commit(m);
                }
            }
        }
        Ok(())
    });
}

/// The status a machine row should carry, or `None` to leave it alone.
///
/// A machine that was connected and stopped responding is
/// `reconnecting` rather than `connecting`, so operators can tell a
/// fresh boot from a lost machine.
fn machine_status(m: &Machine, connected: bool) -> Option<&'static str> {
    if m.status == status::STOPPING || m.status.starts_with("unsupported") {
        return None;
    }
    if connected {
        return Some(status::CONNECTED);
    }
    if (m.status == status::CONNECTED || m.status == status::RECONNECTING)
        && !m.public_ip.is_empty()
    {
        return Some(status::RECONNECTING);
    }
    if !m.public_ip.is_empty() {
        return Some(status::CONNECTING);
    }
    if m.cloud_id.is_empty() {
        return Some(status::BOOTING);
    }
    None
}
