//! Translation of placement rules into Kubernetes affinities.
//!
//! Placements relative to another container become pod
//! (anti-)affinities keyed on the `hostname` pod label; placements on
//! machine attributes become node affinities on the labels the node
//! label writer maintains.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodAffinity,
    PodAffinityTerm, PodAntiAffinity,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use kelda_db::Placement;

/// Pod label carrying the container's blueprint hostname.
pub(crate) const HOSTNAME_LABEL: &str = "hostname";

/// Node labels maintained by the node label writer.
pub(crate) const PROVIDER_LABEL: &str = "provider";
pub(crate) const REGION_LABEL: &str = "region";
pub(crate) const SIZE_LABEL: &str = "size";
pub(crate) const FLOATING_IP_LABEL: &str = "floatingIP";

const HOST_TOPOLOGY: &str = "kubernetes.io/hostname";

/// Build the affinity for each target container that has placement
/// rules, keyed by hostname.
pub fn to_affinities(placements: &[Placement]) -> HashMap<String, Affinity> {
    let mut affinities: HashMap<String, Affinity> = HashMap::new();

    for placement in placements {
        let affinity = affinities
            .entry(placement.target_container.clone())
            .or_default();

        if !placement.other_container.is_empty() {
            let term = PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: HOSTNAME_LABEL.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![placement.other_container.clone()]),
                    }]),
                    ..Default::default()
                }),
                topology_key: HOST_TOPOLOGY.to_string(),
                ..Default::default()
            };

            if placement.exclusive {
                affinity
                    .pod_anti_affinity
                    .get_or_insert_with(PodAntiAffinity::default)
                    .required_during_scheduling_ignored_during_execution
                    .get_or_insert_with(Vec::new)
                    .push(term);
            } else {
                affinity
                    .pod_affinity
                    .get_or_insert_with(PodAffinity::default)
                    .required_during_scheduling_ignored_during_execution
                    .get_or_insert_with(Vec::new)
                    .push(term);
            }
        }

        let machine_attrs = [
            (PROVIDER_LABEL, &placement.provider),
            (REGION_LABEL, &placement.region),
            (SIZE_LABEL, &placement.size),
            (FLOATING_IP_LABEL, &placement.floating_ip),
        ];
        let operator = if placement.exclusive { "NotIn" } else { "In" };
        let requirements: Vec<NodeSelectorRequirement> = machine_attrs
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| NodeSelectorRequirement {
                key: key.to_string(),
                operator: operator.to_string(),
                values: Some(vec![value.to_string()]),
            })
            .collect();

        if !requirements.is_empty() {
            let selector = affinity
                .node_affinity
                .get_or_insert_with(NodeAffinity::default)
                .required_during_scheduling_ignored_during_execution
                .get_or_insert_with(|| NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm::default()],
                });
            selector.node_selector_terms[0]
                .match_expressions
                .get_or_insert_with(Vec::new)
                .extend(requirements);
        }
    }

    affinities
}
