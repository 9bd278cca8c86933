//! Endpoint pods
//!
//! Every lab pod runs a curriculum-sync init container that shallow-clones
//! the curriculum into a shared volume, so lesson files are available to the
//! endpoint (and to the Jupyter guide server) before it starts.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, LocalObjectReference, Pod, PodSpec,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use antidote_common::models::{Lesson, LessonEndpoint, JUPYTER_ENDPOINT_NAME};

use super::endpoint_labels;
use super::network::NETWORKS_ANNOTATION;
use crate::config::SchedulerConfig;

/// Mount point of the curriculum checkout
pub const CURRICULUM_DIR: &str = "/antidote";

const CURRICULUM_VOLUME: &str = "curriculum";

/// Name of the init container cloning the curriculum
pub(crate) const CURRICULUM_SYNC_CONTAINER: &str = "curriculum-sync";

/// Init container cloning the curriculum into the shared volume
pub(crate) fn curriculum_sync_container(config: &SchedulerConfig) -> Container {
    Container {
        name: CURRICULUM_SYNC_CONTAINER.to_string(),
        image: Some(config.images.curriculum_sync.clone()),
        command: Some(vec![
            "git".to_string(),
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            "--branch".to_string(),
            config.curriculum.repo_branch.clone(),
            config.curriculum.repo_remote.clone(),
            CURRICULUM_DIR.to_string(),
        ]),
        volume_mounts: Some(vec![curriculum_mount()]),
        ..Default::default()
    }
}

pub(crate) fn curriculum_mount() -> VolumeMount {
    VolumeMount {
        name: CURRICULUM_VOLUME.to_string(),
        mount_path: CURRICULUM_DIR.to_string(),
        ..Default::default()
    }
}

pub(crate) fn curriculum_volume() -> Volume {
    Volume {
        name: CURRICULUM_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub(crate) fn pull_secrets(config: &SchedulerConfig) -> Option<Vec<LocalObjectReference>> {
    config.pull_secret_name.as_ref().map(|name| {
        vec![LocalObjectReference {
            name: name.clone(),
        }]
    })
}

/// Build the pod for one endpoint
pub fn build_pod(
    config: &SchedulerConfig,
    lesson: &Lesson,
    endpoint: &LessonEndpoint,
    namespace: &str,
    live_lesson_id: &str,
) -> Pod {
    let is_guide = endpoint.name == JUPYTER_ENDPOINT_NAME;

    let networks = lesson.networks_for(&endpoint.name);
    let annotations = (!networks.is_empty())
        .then(|| BTreeMap::from([(NETWORKS_ANNOTATION.to_string(), networks.join(", "))]));

    let ports: Vec<ContainerPort> = endpoint
        .ports()
        .into_iter()
        .map(|port| ContainerPort {
            container_port: i32::from(port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let (image, env, privileged) = if is_guide {
        let env = vec![EnvVar {
            name: "LESSON_DIR".to_string(),
            value: Some(format!("{}/{}", CURRICULUM_DIR, lesson.lesson_dir)),
            ..Default::default()
        }];
        (config.images.jupyter.clone(), Some(env), false)
    } else {
        // Network device images need raw access to their interfaces
        (endpoint.image.clone(), None, true)
    };

    let container = Container {
        name: endpoint.name.clone(),
        image: Some(image),
        ports: (!ports.is_empty()).then_some(ports),
        env,
        security_context: Some(SecurityContext {
            privileged: Some(privileged),
            ..Default::default()
        }),
        volume_mounts: Some(vec![curriculum_mount()]),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(endpoint.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(endpoint_labels(live_lesson_id, &endpoint.name)),
            annotations,
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: Some(vec![curriculum_sync_container(config)]),
            containers: vec![container],
            volumes: Some(vec![curriculum_volume()]),
            image_pull_secrets: pull_secrets(config),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Coarse pod lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// Not yet running
    Pending,
    /// Running
    Running,
    /// Terminated successfully
    Succeeded,
    /// Terminated with an error
    Failed,
}

/// Phase reported in a pod's status
pub fn pod_phase(pod: &Pod) -> PodPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Pending,
    }
}

/// Pod is running and every container reports ready
pub fn pod_ready(pod: &Pod) -> bool {
    if pod_phase(pod) != PodPhase::Running {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| !statuses.is_empty() && statuses.iter().all(|c| c.ready))
        .unwrap_or(false)
}
