//! Kubernetes materialization of the container table.
//!
//! The spec builder renders container rows into Deployment, ConfigMap,
//! and Secret objects deterministically — every map is sorted before
//! emission, because Kubernetes treats any ordering difference as a
//! reason to restart the pod. The workload reconciler then drives the
//! apiserver toward those objects with three name-keyed joins, and the
//! status updater maps observed pods back onto container rows.

mod affinity;
mod client;
mod configmap;
mod deployment;
mod hash;
mod image;
mod node_labels;
mod secrets;
mod status;
mod workload;

pub use affinity::to_affinities;
pub use client::{
    connect, ConfigMapsApi, DeploymentsApi, KubeClients, KubeError, KubeResult, NodeDescription,
    NodesApi, PodsApi, SecretsApi,
};
pub use configmap::{desired_config_maps, FileMap};
pub use deployment::{desired_deployments, DeploymentBuilder};
pub use image::{run_image_builder, DockerImageBuilder, ImageBuilder};
pub use node_labels::{run_node_labels, update_node_labels};
pub use secrets::{kube_secret_name, KubeSecretSource, SecretSource};
pub use status::{run_pod_status, update_container_statuses};
pub use workload::{run_workloads, run_workload_once, WorkloadClients};
