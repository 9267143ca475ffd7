//! Local provider backed by the vagrant CLI.
//!
//! Each machine is a VirtualBox VM in its own directory under
//! `~/.kelda/vagrant/<namespace>/<id>`, with a host-only static IP
//! recorded next to the Vagrantfile. The adapter exists so blueprints can
//! be developed without cloud credentials; it has no firewall and no
//! floating IPs, and rejects preemptible machines outright.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProviderError, ProviderResult};
use crate::types::{Acl, Machine};
use crate::Provider;

const BOX_NAME: &str = "ubuntu/xenial64";

/// The local vagrant provider.
pub struct Vagrant {
    root: PathBuf,
}

impl Vagrant {
    /// Machines live under `~/.kelda/vagrant/<namespace>`.
    pub fn new(namespace: &str) -> ProviderResult<Vagrant> {
        let home = std::env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
        let root = Path::new(&home)
            .join(".kelda")
            .join("vagrant")
            .join(namespace.to_lowercase());
        Vagrant::with_root(root)
    }

    /// Build an adapter over an explicit machine directory. Used by tests.
    pub fn with_root(root: PathBuf) -> ProviderResult<Vagrant> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create {}", root.display()))?;
        Ok(Vagrant { root })
    }

    fn machine_dirs(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Pick the next free host-only address, skipping IPs already handed
    /// to other machines in this namespace.
    fn allocate_ip(&self) -> anyhow::Result<String> {
        let used: Vec<String> = self
            .machine_dirs()?
            .iter()
            .filter_map(|dir| std::fs::read_to_string(dir.join("ip")).ok())
            .map(|ip| ip.trim().to_string())
            .collect();

        for octet in 10..250 {
            let candidate = format!("192.168.56.{octet}");
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        bail!("no free host-only addresses left");
    }

    async fn vagrant(&self, dir: &Path, args: &[&str]) -> anyhow::Result<String> {
        let output = Command::new("vagrant")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .context("spawn vagrant")?;
        if !output.status.success() {
            bail!(
                "vagrant {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn is_running(&self, dir: &Path) -> bool {
        match self.vagrant(dir, &["status", "--machine-readable"]).await {
            Ok(out) => out.lines().any(|l| l.contains(",state,running")),
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "vagrant status failed");
                false
            }
        }
    }

    async fn destroy(&self, dir: &Path) -> anyhow::Result<()> {
        self.vagrant(dir, &["destroy", "-f"]).await?;
        std::fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
        Ok(())
    }
}

/// Render the Vagrantfile for one machine. `size` is "memoryMB,cpus";
/// missing fields fall back to 1024 MB and 1 CPU.
fn vagrantfile(size: &str, ip: &str) -> String {
    let (memory, cpus) = parse_size(size);
    format!(
        r#"Vagrant.configure("2") do |config|
  config.vm.box = "{BOX_NAME}"
  config.vm.network "private_network", ip: "{ip}"
  config.vm.provider "virtualbox" do |vb|
    vb.memory = {memory}
    vb.cpus = {cpus}
  end
end
"#
    )
}

fn parse_size(size: &str) -> (u32, u32) {
    let mut parts = size.split(',');
    let memory = parts
        .next()
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(1024);
    let cpus = parts
        .next()
        .and_then(|c| c.trim().parse().ok())
        .unwrap_or(1);
    (memory, cpus)
}

#[async_trait]
impl Provider for Vagrant {
    async fn list(&self) -> ProviderResult<Vec<Machine>> {
        let mut machines = Vec::new();
        for dir in self.machine_dirs()? {
            if !self.is_running(&dir).await {
                continue;
            }
            let id = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let ip = std::fs::read_to_string(dir.join("ip"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let size = std::fs::read_to_string(dir.join("size"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            machines.push(Machine {
                cloud_id: id,
                public_ip: ip.clone(),
                private_ip: ip,
                size,
                ..Default::default()
            });
        }
        Ok(machines)
    }

    async fn boot(&self, machines: Vec<Machine>) -> ProviderResult<Vec<String>> {
        for m in &machines {
            if m.preemptible {
                return Err(ProviderError::Unsupported(
                    "vagrant does not support preemptible instances".to_string(),
                ));
            }
        }

        let mut ids = Vec::new();
        for m in &machines {
            let id = Uuid::new_v4().to_string();
            let dir = self.root.join(&id);
            std::fs::create_dir_all(&dir).context("create machine dir")?;

            let ip = self.allocate_ip()?;
            std::fs::write(dir.join("Vagrantfile"), vagrantfile(&m.size, &ip))
                .context("write Vagrantfile")?;
            std::fs::write(dir.join("ip"), &ip).context("write ip")?;
            std::fs::write(dir.join("size"), &m.size).context("write size")?;

            if let Err(err) = self.vagrant(&dir, &["up"]).await {
                if let Err(destroy_err) = self.destroy(&dir).await {
                    warn!(error = %destroy_err, "failed to destroy after boot error");
                }
                return Err(err.into());
            }
            ids.push(id);
        }
        Ok(ids)
    }

    async fn stop(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        let mut errors = Vec::new();
        for m in machines {
            let dir = self.root.join(&m.cloud_id);
            if let Err(e) = self.destroy(&dir).await {
                errors.push(format!("destroy {}: {e}", m.cloud_id));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{}", errors.join(", ")).into())
        }
    }

    async fn set_acls(&self, _acls: Vec<Acl>) -> ProviderResult<()> {
        // The local provider has no firewall.
        debug!("vagrant: ignoring ACLs");
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<Machine>) -> ProviderResult<()> {
        if machines.iter().any(|m| !m.floating_ip.is_empty()) {
            return Err(ProviderError::Unsupported(
                "vagrant does not support floating IPs".to_string(),
            ));
        }
        Ok(())
    }

    async fn cleanup(&self) -> ProviderResult<()> {
        for dir in self.machine_dirs()? {
            if let Err(err) = self.destroy(&dir).await {
                warn!(dir = %dir.display(), error = %err, "vagrant cleanup failed");
            }
        }
        Ok(())
    }
}
