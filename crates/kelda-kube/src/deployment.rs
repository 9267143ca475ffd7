//! The deployment spec builder.
//!
//! Builds the desired Deployment for each container row. The build must
//! be byte-identical across reconciliations — Kubernetes compares
//! objects field by field, and any incidental difference (an unsorted
//! env list, a reordered volume mount) restarts the pod. Every list is
//! therefore sorted by a stable key before emission.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container as PodContainer, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use kelda_blueprint::{divide_container_values, ContainerValue};
use kelda_db::{self as db, ImageStatus};

use crate::affinity::{to_affinities, HOSTNAME_LABEL};
use crate::configmap::FileMap;
use crate::hash::{hash_container_value_map, hash_str};
use crate::secrets::{kube_secret_name, SECRET_ITEM_KEY};

// Annotations on the pod template. The status updater joins pods back
// to container rows through `keldaIP`; the hash annotations restart the
// pod when the underlying inputs change.
const ENV_HASH_KEY: &str = "env-hash";
const FILES_HASH_KEY: &str = "files-hash";
const DOCKERFILE_HASH_KEY: &str = "dockerfile-hash";
const IMAGE_KEY: &str = "friendly-image";
pub(crate) const KELDA_IP_KEY: &str = "keldaIP";

/// Builds the desired Deployment for each container row.
///
/// Construction gathers everything a build needs — custom image digests,
/// placement affinities, and resolved secret values — so `deployment_for`
/// itself is a pure function.
pub struct DeploymentBuilder {
    custom_images: HashMap<(String, String), db::Image>,
    affinities: HashMap<String, Affinity>,
    resolved_secrets: HashMap<String, String>,
}

impl DeploymentBuilder {
    pub fn new(
        images: Vec<db::Image>,
        placements: Vec<db::Placement>,
        resolved_secrets: HashMap<String, String>,
    ) -> DeploymentBuilder {
        let custom_images = images
            .into_iter()
            .map(|img| ((img.name.clone(), img.dockerfile.clone()), img))
            .collect();
        DeploymentBuilder {
            custom_images,
            affinities: to_affinities(&placements),
            resolved_secrets,
        }
    }

    /// The Deployment for one container row, or `None` if the container
    /// isn't deployable yet (custom image still building, or a
    /// referenced secret unresolved) — skipped this pass, not failed.
    pub fn deployment_for(&self, dbc: &db::Container) -> Option<Deployment> {
        let pod = self.pod_for(dbc)?;

        let mut annotations = BTreeMap::new();
        annotations.insert(DOCKERFILE_HASH_KEY.to_string(), hash_str(&dbc.dockerfile));
        annotations.insert(
            FILES_HASH_KEY.to_string(),
            hash_container_value_map(&dbc.filepath_to_content),
        );
        annotations.insert(ENV_HASH_KEY.to_string(), hash_container_value_map(&dbc.env));
        annotations.insert(IMAGE_KEY.to_string(), dbc.image.clone());
        annotations.insert(KELDA_IP_KEY.to_string(), dbc.ip.clone());

        let mut labels = BTreeMap::new();
        labels.insert(HOSTNAME_LABEL.to_string(), dbc.hostname.clone());

        Some(Deployment {
            metadata: ObjectMeta {
                name: Some(dbc.hostname.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                // Destroy the old pod before creating its replacement:
                // two pods must never share a blueprint IP.
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn pod_for(&self, dbc: &db::Container) -> Option<PodSpec> {
        // Containers built from a Dockerfile wait for the image build,
        // then run the pushed digest instead of the friendly name.
        let mut image = dbc.image.clone();
        if !dbc.dockerfile.is_empty() {
            let built = self
                .custom_images
                .get(&(dbc.image.clone(), dbc.dockerfile.clone()))?;
            if built.status != ImageStatus::Built || built.repo_digest.is_empty() {
                return None;
            }
            image = built.repo_digest.clone();
        }

        let (mut volumes, mut mounts) = self.pod_volumes(&dbc.filepath_to_content);
        let mut env = self.secret_hash_env(dbc)?;
        env.extend(pod_env(&dbc.env));

        env.sort_by(|a, b| a.name.cmp(&b.name));
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));

        Some(PodSpec {
            hostname: Some(dbc.hostname.clone()),
            containers: vec![PodContainer {
                name: dbc.hostname.clone(),
                image: Some(image),
                args: some_if_nonempty(dbc.command.clone()),
                env: some_if_nonempty(env),
                volume_mounts: some_if_nonempty(mounts),
                ..Default::default()
            }],
            affinity: self.affinities.get(&dbc.hostname).cloned(),
            dns_policy: Some("Default".to_string()),
            volumes: some_if_nonempty(volumes),
            ..Default::default()
        })
    }

    fn pod_volumes(
        &self,
        filepath_to_content: &BTreeMap<String, ContainerValue>,
    ) -> (Vec<Volume>, Vec<VolumeMount>) {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();

        let (_, secret_files) = divide_container_values(filepath_to_content);
        let mut mounted = BTreeMap::new();
        for (path, secret_name) in secret_files {
            let kube_name = kube_secret_name(&secret_name);
            let volume_name = format!("secret-volume-{kube_name}");

            // Several paths may reference the same secret; mount its
            // volume once.
            if mounted.insert(volume_name.clone(), ()).is_none() {
                volumes.push(Volume {
                    name: volume_name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(kube_name),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: path,
                sub_path: Some(SECRET_ITEM_KEY.to_string()),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let file_map = FileMap::new(filepath_to_content);
        if !file_map.is_empty() {
            volumes.push(file_map.volume());
            mounts.extend(file_map.volume_mounts());
        }
        (volumes, mounts)
    }

    /// One env var per referenced secret carrying the hash of its value,
    /// so a rotated secret restarts the pod. `None` while any referenced
    /// secret is unresolved.
    fn secret_hash_env(&self, dbc: &db::Container) -> Option<Vec<EnvVar>> {
        let mut env = Vec::new();
        for name in crate::secrets::referenced_secret_names(std::slice::from_ref(dbc)) {
            let value = self.resolved_secrets.get(&name)?;
            env.push(EnvVar {
                name: format!("SECRET_HASH_{name}"),
                value: Some(hash_str(value)),
                value_from: None,
            });
        }
        Some(env)
    }
}

fn pod_env(env: &BTreeMap<String, ContainerValue>) -> Vec<EnvVar> {
    let (raw, secrets) = divide_container_values(env);
    let mut vars = Vec::new();
    for (name, value) in raw {
        vars.push(EnvVar {
            name,
            value: Some(value),
            value_from: None,
        });
    }
    for (name, secret_name) in secrets {
        vars.push(EnvVar {
            name,
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(kube_secret_name(&secret_name)),
                    key: SECRET_ITEM_KEY.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
        });
    }
    vars
}

fn some_if_nonempty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// The Deployments the cluster should hold: one per container row that
/// has an IP and is deployable this pass.
pub fn desired_deployments(
    containers: &[db::Container],
    images: Vec<db::Image>,
    placements: Vec<db::Placement>,
    resolved_secrets: HashMap<String, String>,
) -> Vec<Deployment> {
    let builder = DeploymentBuilder::new(images, placements, resolved_secrets);
    containers
        .iter()
        .filter(|dbc| !dbc.ip.is_empty())
        .filter_map(|dbc| builder.deployment_for(dbc))
        .collect()
}
