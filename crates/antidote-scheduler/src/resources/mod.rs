//! Builders for the cluster objects that make up one lab
//!
//! Every builder is a pure function from lesson and lab state to a
//! `k8s-openapi` object, so the exact shape of what gets created is unit
//! tested without a cluster. All objects for a lab live in one namespace
//! named by [`namespace_name`].

mod ingress;
mod job;
mod namespace;
mod network;
mod pod;
mod policy;
mod secret;
mod service;

use std::collections::BTreeMap;

use antidote_common::{LABEL_ENDPOINT, LABEL_LIVE_LESSON, LABEL_MANAGED_BY, LABEL_MANAGED_BY_ANTIDOTE};

pub use ingress::{build_ingress, ingress_name, ingress_path};
pub use job::{
    build_config_job, config_job_name, config_job_selector, ConfigRunner, CONFIGURATOR_CONTAINER,
    JOB_BACKOFF,
};
pub use namespace::{build_namespace, instance_selector, namespace_name};
pub use network::{
    build_networks, NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec,
    NETWORKS_ANNOTATION,
};
pub use pod::{build_pod, pod_phase, pod_ready, PodPhase, CURRICULUM_DIR};
pub(crate) use pod::CURRICULUM_SYNC_CONTAINER;
pub use policy::{build_network_policy, EGRESS_POLICY_NAME};
pub use secret::copy_secret;
pub use service::build_service;

/// Labels shared by every workload object of one endpoint
pub(crate) fn endpoint_labels(live_lesson_id: &str, endpoint: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_ANTIDOTE.to_string(),
        ),
        (LABEL_LIVE_LESSON.to_string(), live_lesson_id.to_string()),
        (LABEL_ENDPOINT.to_string(), endpoint.to_string()),
    ])
}

/// Labels on objects that belong to the lab as a whole
pub(crate) fn lab_labels(live_lesson_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_ANTIDOTE.to_string(),
        ),
        (LABEL_LIVE_LESSON.to_string(), live_lesson_id.to_string()),
    ])
}
