//! Configuration jobs
//!
//! One job per configured endpoint. The runner is picked from the stage's
//! config file for that endpoint:
//! - `.py` runs with python
//! - `.yml` / `.yaml` runs with ansible-playbook against the endpoint only
//! - anything else is pushed with napalm using the image's driver

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use antidote_common::kube_utils::label_selector;
use antidote_common::models::{Image, Lesson};
use antidote_common::{Error, Result, JOB_TYPE_CONFIG, LABEL_CONFIG_POD, LABEL_JOB_TYPE};

use super::endpoint_labels;
use super::pod::{curriculum_mount, curriculum_sync_container, curriculum_volume, pull_secrets};
use super::CURRICULUM_DIR;
use crate::config::SchedulerConfig;

/// Pod attempts before a configuration job is abandoned
pub const JOB_BACKOFF: i32 = 3;

/// Name of the container applying configuration
pub const CONFIGURATOR_CONTAINER: &str = "configurator";

/// Name of the configuration job for an endpoint
pub fn config_job_name(endpoint: &str) -> String {
    format!("config-{}", endpoint)
}

/// Selector matching every configuration job (and its pods) in a lab
pub fn config_job_selector() -> String {
    label_selector(&BTreeMap::from([(
        LABEL_JOB_TYPE.to_string(),
        JOB_TYPE_CONFIG.to_string(),
    )]))
}

/// How an endpoint's configuration file is applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigRunner {
    /// Run a python script
    Python,
    /// Run an ansible playbook
    Ansible,
    /// Replace the device configuration through napalm
    Napalm {
        /// napalm driver (e.g. "junos")
        driver: String,
    },
}

impl ConfigRunner {
    /// Pick the runner for a config file
    ///
    /// The napalm driver comes from the image, or from a
    /// `napalm-<driver>` configuration type.
    pub fn select(
        endpoint: &str,
        file: &str,
        configuration_type: Option<&str>,
        image: &Image,
    ) -> Result<Self> {
        let ext = file.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
        match ext {
            "py" => Ok(Self::Python),
            "yml" | "yaml" => Ok(Self::Ansible),
            _ => image
                .napalm_driver
                .clone()
                .or_else(|| {
                    configuration_type
                        .and_then(|t| t.strip_prefix("napalm-"))
                        .map(str::to_string)
                })
                .map(|driver| Self::Napalm { driver })
                .ok_or_else(|| {
                    Error::validation_for(
                        endpoint,
                        format!("no napalm driver known for image {}", image.name),
                    )
                }),
        }
    }

    /// Command line applying `path` to `host`
    pub fn command(&self, host: &str, path: &str, image: &Image) -> Vec<String> {
        let args: Vec<&str> = match self {
            Self::Python => vec![
                "python",
                path,
                host,
                image.ssh_user.as_str(),
                image.ssh_password.as_str(),
            ],
            Self::Ansible => {
                return vec![
                    "ansible-playbook".to_string(),
                    "-i".to_string(),
                    format!("{},", host),
                    path.to_string(),
                    "-e".to_string(),
                    format!(
                        "ansible_user={} ansible_password={}",
                        image.ssh_user, image.ssh_password
                    ),
                ];
            }
            Self::Napalm { driver } => vec![
                "napalm",
                "--user",
                image.ssh_user.as_str(),
                "--password",
                image.ssh_password.as_str(),
                "--vendor",
                driver.as_str(),
                host,
                "configure",
                path,
                "--strategy",
                "replace",
            ],
        };
        args.into_iter().map(str::to_string).collect()
    }
}

/// Path of a stage config file inside the curriculum checkout
pub(crate) fn config_file_path(lesson: &Lesson, stage: u32, file: &str) -> String {
    format!(
        "{}/{}/stage{}/configs/{}",
        CURRICULUM_DIR, lesson.lesson_dir, stage, file
    )
}

/// Job applying one endpoint's stage configuration
#[allow(clippy::too_many_arguments)]
pub fn build_config_job(
    config: &SchedulerConfig,
    lesson: &Lesson,
    stage: u32,
    endpoint: &str,
    host: &str,
    file: &str,
    runner: &ConfigRunner,
    image: &Image,
    namespace: &str,
    live_lesson_id: &str,
) -> Job {
    let mut labels = endpoint_labels(live_lesson_id, endpoint);
    labels.insert(LABEL_JOB_TYPE.to_string(), JOB_TYPE_CONFIG.to_string());

    let mut pod_labels = labels.clone();
    pod_labels.insert(LABEL_CONFIG_POD.to_string(), "true".to_string());

    let path = config_file_path(lesson, stage, file);
    let container = Container {
        name: CONFIGURATOR_CONTAINER.to_string(),
        image: Some(config.images.configurator.clone()),
        command: Some(runner.command(host, &path, image)),
        volume_mounts: Some(vec![curriculum_mount()]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(config_job_name(endpoint)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(JOB_BACKOFF),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![curriculum_sync_container(config)]),
                    containers: vec![container],
                    volumes: Some(vec![curriculum_volume()]),
                    image_pull_secrets: pull_secrets(config),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
