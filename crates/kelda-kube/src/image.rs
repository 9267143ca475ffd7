//! The image build reconciler.
//!
//! Advances image rows queued → building → built. Builds run as
//! detached tasks bounded by a counting semaphore, so a blueprint with
//! dozens of custom images cannot saturate the docker daemon. A failed
//! build drops the row back to queued and is retried on a later tick.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use kelda_db::{Conn, Image, ImageStatus, Table};

/// Maximum simultaneous image builds.
const BUILD_CONCURRENCY: usize = 8;

/// Builds an image and pushes it somewhere pods can pull from.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `dockerfile`, push it as `name`, and return the pushed
    /// repo digest.
    async fn build_and_push(&self, name: &str, dockerfile: &str) -> anyhow::Result<String>;
}

/// The real builder: shells out to the docker CLI and pushes to the
/// deployment's registry.
pub struct DockerImageBuilder {
    pub registry: String,
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build_and_push(&self, name: &str, dockerfile: &str) -> anyhow::Result<String> {
        let tag = format!("{}/{}", self.registry, name);

        let mut build = Command::new("docker")
            .args(["build", "-t", &tag, "-"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("spawn docker build")?;
        {
            use tokio::io::AsyncWriteExt;
            let mut stdin = build.stdin.take().context("docker build stdin")?;
            stdin.write_all(dockerfile.as_bytes()).await?;
        }
        let output = build.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "docker build failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let output = Command::new("docker")
            .args(["push", &tag])
            .output()
            .await
            .context("spawn docker push")?;
        if !output.status.success() {
            bail!(
                "docker push failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        // The push output's last lines carry "digest: sha256:...".
        let stdout = String::from_utf8_lossy(&output.stdout);
        let digest = stdout
            .lines()
            .rev()
            .find_map(|line| {
                line.split_whitespace()
                    .find(|word| word.starts_with("sha256:"))
            })
            .context("no digest in docker push output")?;
        Ok(format!("{tag}@{digest}"))
    }
}

/// Build queued images until shutdown.
pub async fn run_image_builder(
    conn: Conn,
    builder: Arc<dyn ImageBuilder>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(BUILD_CONCURRENCY));
    let mut trigger = conn.trigger_tick(30, &[Table::Image, Table::Etcd]);
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
        start_queued_builds(&conn, &builder, &permits);
    }
    info!("image builder stopped");
}

/// Mark every queued image as building and kick off its build task.
fn start_queued_builds(conn: &Conn, builder: &Arc<dyn ImageBuilder>, permits: &Arc<Semaphore>) {
    let mut queued = Vec::new();
    let _ = conn.txn(&[Table::Image]).run(|view| {
        for mut image in view.images() {
            if image.status != ImageStatus::Queued {
                continue;
            }
            image.status = ImageStatus::Building;
            view.commit(image.clone());
            queued.push(image);
        }
        Ok(())
    });

    for image in queued {
        let conn = conn.clone();
        let builder = Arc::clone(builder);
        let permits = Arc::clone(permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            info!(image = %image.name, "building image");
            match builder.build_and_push(&image.name, &image.dockerfile).await {
                Ok(digest) => finish_build(&conn, &image, ImageStatus::Built, digest),
                Err(err) => {
                    warn!(image = %image.name, error = %err, "image build failed");
                    // Back to queued; a later tick retries.
                    finish_build(&conn, &image, ImageStatus::Queued, String::new());
                }
            }
        });
    }
}

fn finish_build(conn: &Conn, image: &Image, status: ImageStatus, digest: String) {
    let _ = conn.txn(&[Table::Image]).run(|view| {
        for mut row in view.images() {
            if row.id == image.id {
                row.status = status;
                row.repo_digest = digest.clone();
                view.commit(row);
            }
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeBuilder {
        digests: Mutex<HashMap<String, anyhow::Result<String>>>,
        builds: Mutex<u32>,
    }

    impl FakeBuilder {
        fn new() -> FakeBuilder {
            FakeBuilder {
                digests: Mutex::new(HashMap::new()),
                builds: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageBuilder for FakeBuilder {
        async fn build_and_push(&self, name: &str, _: &str) -> anyhow::Result<String> {
            *self.builds.lock().unwrap() += 1;
            match self.digests.lock().unwrap().remove(name) {
                Some(result) => result,
                None => Ok(format!("registry/{name}@sha256:abc")),
            }
        }
    }

    fn seed_image(conn: &Conn, name: &str) {
        conn.txn(&[Table::Image])
            .run(|view| {
                let mut image = view.insert_image();
                image.name = name.to_string();
                image.dockerfile = "FROM alpine".to_string();
                view.commit(image);
                Ok(())
            })
            .unwrap();
    }

    async fn wait_for_status(conn: &Conn, status: ImageStatus) -> Image {
        for _ in 0..100 {
            if let Some(image) = conn.images().into_iter().find(|i| i.status == status) {
                return image;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("image never reached {status}");
    }

    #[tokio::test]
    async fn queued_image_builds_to_digest() {
        let conn = Conn::new();
        seed_image(&conn, "custom");
        let builder: Arc<dyn ImageBuilder> = Arc::new(FakeBuilder::new());
        let permits = Arc::new(Semaphore::new(BUILD_CONCURRENCY));

        start_queued_builds(&conn, &builder, &permits);

        let built = wait_for_status(&conn, ImageStatus::Built).await;
        assert_eq!(built.repo_digest, "registry/custom@sha256:abc");
    }

    #[tokio::test]
    async fn failed_build_requeues() {
        let conn = Conn::new();
        seed_image(&conn, "flaky");
        let fake = FakeBuilder::new();
        fake.digests
            .lock()
            .unwrap()
            .insert("flaky".to_string(), Err(anyhow::anyhow!("network blip")));
        let builder: Arc<dyn ImageBuilder> = Arc::new(fake);
        let permits = Arc::new(Semaphore::new(BUILD_CONCURRENCY));

        start_queued_builds(&conn, &builder, &permits);

        let requeued = wait_for_status(&conn, ImageStatus::Queued).await;
        assert!(requeued.repo_digest.is_empty());
    }

    #[tokio::test]
    async fn building_images_are_not_restarted() {
        let conn = Conn::new();
        seed_image(&conn, "custom");
        conn.txn(&[Table::Image])
            .run(|view| {
                let mut image = view.images().remove(0);
                image.status = ImageStatus::Building;
                view.commit(image);
                Ok(())
            })
            .unwrap();

        let fake = Arc::new(FakeBuilder::new());
        let builder: Arc<dyn ImageBuilder> = fake.clone();
        let permits = Arc::new(Semaphore::new(BUILD_CONCURRENCY));
        start_queued_builds(&conn, &builder, &permits);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*fake.builds.lock().unwrap(), 0);
    }
}
