//! Endpoint configuration through batch jobs
//!
//! Configuration runs as one job per configured endpoint. Jobs left over from
//! an earlier stage are deleted first, and both the jobs and their pods are
//! awaited so two stages never touch a device at once. All jobs are then polled together; the phase succeeds only if every
//! job succeeds.

use std::sync::Arc;

use futures::future::try_join_all;
use k8s_openapi::api::batch::v1::Job;
use tracing::{debug, info, instrument, warn};

use antidote_common::kube_utils::poll_until;
use antidote_common::models::{Lesson, LiveLesson};
use antidote_common::store::DataStore;
use antidote_common::{Error, Result};

use crate::cluster::{required, tolerate_existing, ClusterClient};
use crate::config::SchedulerConfig;
use crate::resources::{
    build_config_job, config_job_name, config_job_selector, namespace_name, pod_phase,
    ConfigRunner, PodPhase, CONFIGURATOR_CONTAINER, JOB_BACKOFF,
};

/// Label the job controller puts on the pods of a job
const JOB_NAME_LABEL: &str = "job-name";

/// Where a configuration job stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Still retrying; keep polling
    Running,
    /// At least one attempt succeeded
    Succeeded,
    /// Failed attempts reached the retry budget
    Exhausted,
}

impl JobOutcome {
    /// Classify a job from its success and failure counts
    ///
    /// One success wins regardless of earlier failures.
    pub fn from_counts(succeeded: i32, failed: i32) -> Self {
        if succeeded >= 1 {
            Self::Succeeded
        } else if failed >= JOB_BACKOFF {
            Self::Exhausted
        } else {
            Self::Running
        }
    }

    /// Classify a job from its status
    pub fn of(job: &Job) -> Self {
        let status = job.status.as_ref();
        Self::from_counts(
            status.and_then(|s| s.succeeded).unwrap_or(0),
            status.and_then(|s| s.failed).unwrap_or(0),
        )
    }

    /// Whether polling can stop
    pub fn is_completed(self) -> bool {
        self != Self::Running
    }
}

/// Applies stage configuration to lab endpoints
pub struct Configurator {
    cluster: Arc<dyn ClusterClient>,
    store: Arc<dyn DataStore>,
    config: Arc<SchedulerConfig>,
}

impl Configurator {
    /// Create a configurator
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn DataStore>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        Self {
            cluster,
            store,
            config,
        }
    }

    /// Delete every configuration job in a namespace and wait until the jobs
    /// and their pods are gone
    #[instrument(skip(self))]
    pub async fn kill_config_jobs(&self, ns: &str) -> Result<()> {
        let selector = config_job_selector();
        let jobs = self.cluster.list_jobs(ns, &selector).await?;
        if jobs.is_empty() {
            return Ok(());
        }

        for job in &jobs {
            if let Some(name) = job.metadata.name.as_deref() {
                self.cluster.delete_job(ns, name).await?;
            }
        }
        debug!(namespace = %ns, count = jobs.len(), "deleted old configuration jobs");

        let timings = &self.config.timings;
        poll_until(
            timings.job_deletion_timeout,
            timings.job_deletion_poll,
            "configuration job deletion",
            format!("old configuration jobs in {} still exist", ns),
            || async {
                if !self.cluster.list_jobs(ns, &selector).await?.is_empty() {
                    return Ok(false);
                }
                // a terminating pod may still be pushing its old config
                Ok(self.cluster.list_pods(ns, &selector).await?.is_empty())
            },
        )
        .await
    }

    /// Configure every endpoint of a lab for its current stage
    #[instrument(skip(self, lesson, ll), fields(live_lesson = %ll.id, stage = ll.stage))]
    pub async fn configure(&self, lesson: &Lesson, ll: &LiveLesson) -> Result<()> {
        let ns = namespace_name(&self.config.instance_id, &ll.id);
        self.kill_config_jobs(&ns).await?;

        let stage = lesson.stage(ll.stage).ok_or_else(|| {
            Error::validation_for(
                &ll.id,
                format!("lesson {} has no stage {}", lesson.slug, ll.stage),
            )
        })?;

        let mut launched = Vec::new();
        for ep in lesson.ordered_endpoints() {
            let Some(configuration_type) = ep.configuration_type.as_deref() else {
                continue;
            };
            let Some(file) = stage.config_for(&ep.name) else {
                info!(endpoint = %ep.name, stage = ll.stage, "no configuration file for stage, skipping");
                continue;
            };

            let image = self.store.get_image(&ep.image).await?;
            let runner = ConfigRunner::select(&ep.name, file, Some(configuration_type), &image)?;
            let host = ll
                .live_endpoints
                .get(&ep.name)
                .map(|e| e.host.clone())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| ep.name.clone());

            let job = build_config_job(
                &self.config,
                lesson,
                ll.stage,
                &ep.name,
                &host,
                file,
                &runner,
                &image,
                &ns,
                &ll.id,
            );
            tolerate_existing(self.cluster.create_job(&ns, &job).await, job.clone())?;
            debug!(endpoint = %ep.name, ?runner, "configuration job created");
            launched.push(ep.name);
        }

        try_join_all(launched.iter().map(|ep| self.wait_for_job(&ns, ep))).await?;
        info!(jobs = launched.len(), "configuration complete");
        Ok(())
    }

    async fn wait_for_job(&self, ns: &str, endpoint: &str) -> Result<()> {
        let name = config_job_name(endpoint);
        let timings = &self.config.timings;

        for _ in 0..timings.job_poll_iterations {
            let job = required(self.cluster.get_job(ns, &name).await?, "Job", &name)?;
            match JobOutcome::of(&job) {
                JobOutcome::Succeeded => return Ok(()),
                JobOutcome::Exhausted => {
                    let logs = self.last_failed_logs(ns, &name).await;
                    warn!(namespace = %ns, job = %name, "configuration job exhausted its retries");
                    return Err(Error::configuration(
                        endpoint,
                        format!("job {} failed {} times", name, JOB_BACKOFF),
                        logs,
                    ));
                }
                JobOutcome::Running => tokio::time::sleep(timings.job_poll_interval).await,
            }
        }

        Err(Error::timeout(
            "configuration",
            format!("job {}/{} did not finish", ns, name),
        ))
    }

    /// Logs of the most recent failed attempt of a job
    async fn last_failed_logs(&self, ns: &str, job: &str) -> Option<String> {
        let selector = format!("{}={}", JOB_NAME_LABEL, job);
        let pods = match self.cluster.list_pods(ns, &selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, job, "failed to list job pods");
                return None;
            }
        };

        let last = pods
            .into_iter()
            .filter(|p| pod_phase(p) == PodPhase::Failed)
            .max_by_key(|p| p.metadata.creation_timestamp.clone().map(|t| t.0))?;
        let pod_name = last.metadata.name?;

        match self
            .cluster
            .pod_logs(ns, &pod_name, CONFIGURATOR_CONTAINER)
            .await
        {
            Ok(logs) => Some(logs),
            Err(e) => {
                warn!(error = %e, pod = %pod_name, "failed to fetch job logs");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use rstest::rstest;

    use antidote_common::models::{
        Image, LessonEndpoint, LessonStage, LiveEndpoint, LiveLessonStatus,
    };
    use antidote_common::store::InMemoryDataStore;

    use crate::cluster::MockClusterClient;
    use crate::config::Timings;

    #[rstest]
    #[case(0, 0, JobOutcome::Running)]
    #[case(0, 2, JobOutcome::Running)]
    #[case(0, 3, JobOutcome::Exhausted)]
    #[case(0, 4, JobOutcome::Exhausted)]
    #[case(1, 0, JobOutcome::Succeeded)]
    #[case(1, 2, JobOutcome::Succeeded)]
    #[case(1, 5, JobOutcome::Succeeded)]
    fn backoff_boundary(#[case] succeeded: i32, #[case] failed: i32, #[case] expected: JobOutcome) {
        let outcome = JobOutcome::from_counts(succeeded, failed);
        assert_eq!(outcome, expected);
        assert_eq!(outcome.is_completed(), expected != JobOutcome::Running);
    }

    fn job_with(succeeded: i32, failed: i32) -> Job {
        Job {
            status: Some(JobStatus {
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn lesson() -> Lesson {
        let ep = |name: &str, config: Option<&str>| LessonEndpoint {
            name: name.into(),
            image: "vqfx".into(),
            configuration_type: config.map(str::to_string),
            ..Default::default()
        };
        Lesson {
            slug: "valid-lesson".into(),
            lesson_dir: "lessons/valid-lesson".into(),
            endpoints: vec![
                ep("vqfx1", Some("napalm")),
                ep("vqfx2", Some("napalm")),
                ep("linux1", Some("python")),
                ep("web", None),
            ],
            stages: vec![
                LessonStage::default(),
                LessonStage {
                    configs: vec!["vqfx1.txt".into(), "vqfx2.txt".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn live_lesson() -> LiveLesson {
        let now = Utc::now();
        LiveLesson {
            id: "ll-1".into(),
            session_id: "abcdef".into(),
            lesson_slug: "valid-lesson".into(),
            stage: 1,
            status: LiveLessonStatus::Configuration,
            error: false,
            live_endpoints: BTreeMap::from([(
                "vqfx1".to_string(),
                LiveEndpoint {
                    name: "vqfx1".into(),
                    host: "10.96.0.10".into(),
                    ..Default::default()
                },
            )]),
            created_time: now,
            last_active_time: now,
            healthy_test_count: 0,
            total_test_count: 0,
        }
    }

    fn store() -> Arc<InMemoryDataStore> {
        let store = Arc::new(InMemoryDataStore::new());
        store.insert_image(Image {
            name: "vqfx".into(),
            ssh_user: "antidote".into(),
            ssh_password: "antidotepassword".into(),
            napalm_driver: Some("junos".into()),
        });
        store
    }

    fn configurator(mock: MockClusterClient) -> Configurator {
        Configurator::new(
            Arc::new(mock),
            store(),
            Arc::new(SchedulerConfig {
                timings: Timings::fast(),
                ..Default::default()
            }),
        )
    }

    /// Story: only endpoints with both a configuration type and a file for
    /// the stage get a job, and the job dials the recorded service address
    #[tokio::test]
    async fn story_jobs_for_configured_endpoints_with_files() {
        let created = Arc::new(Mutex::new(Vec::<Job>::new()));
        let c = created.clone();

        let mut mock = MockClusterClient::new();
        mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
        mock.expect_create_job().returning(move |ns, job| {
            assert_eq!(ns, "antidote-ll-1");
            c.lock().unwrap().push(job.clone());
            Ok(job.clone())
        });
        mock.expect_get_job().returning(|_, _| Ok(Some(job_with(1, 0))));

        configurator(mock)
            .configure(&lesson(), &live_lesson())
            .await
            .unwrap();

        let created = created.lock().unwrap();
        let names: Vec<_> = created
            .iter()
            .map(|j| j.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["config-vqfx1", "config-vqfx2"]);

        let command = created[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .command
            .clone()
            .unwrap();
        assert!(command.contains(&"10.96.0.10".to_string()));
        let command = created[1].spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .command
            .clone()
            .unwrap();
        assert!(command.contains(&"vqfx2".to_string()));
    }

    /// Story: a job that keeps failing fails the whole phase, carrying the
    /// logs of its newest failed attempt
    #[tokio::test]
    async fn story_exhausted_job_fails_phase_with_last_logs() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
        mock.expect_create_job().returning(|_, job| Ok(job.clone()));
        mock.expect_get_job().returning(|_, name| {
            if name == "config-vqfx2" {
                Ok(Some(job_with(0, 3)))
            } else {
                Ok(Some(job_with(1, 0)))
            }
        });
        mock.expect_list_pods()
            .withf(|_, selector| selector == "job-name=config-vqfx2")
            .returning(|_, _| {
                let failed = |name: &str, minute: u32| Pod {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        creation_timestamp: Some(Time(
                            Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
                        )),
                        ..Default::default()
                    },
                    status: Some(PodStatus {
                        phase: Some("Failed".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                Ok(vec![failed("attempt-1", 1), failed("attempt-3", 3), failed("attempt-2", 2)])
            });
        mock.expect_pod_logs()
            .returning(|_, pod, _| Ok(format!("{} logs", pod)));

        let err = configurator(mock)
            .configure(&lesson(), &live_lesson())
            .await
            .unwrap_err();
        match err {
            Error::Configuration { endpoint, logs, .. } => {
                assert_eq!(endpoint, "vqfx2");
                assert_eq!(logs.as_deref(), Some("attempt-3 logs"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn running_job_times_out_after_poll_budget() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
        mock.expect_create_job().returning(|_, job| Ok(job.clone()));
        mock.expect_get_job()
            .returning(|_, _| Ok(Some(job_with(0, 1))));

        let err = configurator(mock)
            .configure(&lesson(), &live_lesson())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    /// Story: stale jobs from a previous stage are removed, and both the jobs
    /// and their still-terminating pods are awaited before new ones start
    #[tokio::test]
    async fn story_old_jobs_are_killed_first() {
        let listings = Arc::new(AtomicU32::new(0));
        let l = listings.clone();
        let pod_listings = Arc::new(AtomicU32::new(0));
        let p = pod_listings.clone();
        let mut mock = MockClusterClient::new();
        mock.expect_list_jobs().returning(move |_, selector| {
            assert_eq!(selector, "antidote.dev/job-type=config");
            // first listing finds a stale job, the next still sees it, then it is gone
            match l.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Ok(vec![Job {
                    metadata: ObjectMeta {
                        name: Some("config-vqfx1".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                }]),
                _ => Ok(vec![]),
            }
        });
        mock.expect_delete_job()
            .withf(|_, name| name == "config-vqfx1")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_list_pods().returning(move |_, selector| {
            assert_eq!(selector, "antidote.dev/job-type=config");
            // the job object is gone but its pod is still terminating once
            match p.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(vec![Pod {
                    metadata: ObjectMeta {
                        name: Some("config-vqfx1-abcde".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                }]),
                _ => Ok(vec![]),
            }
        });

        configurator(mock)
            .kill_config_jobs("antidote-ll-1")
            .await
            .unwrap();
        assert_eq!(listings.load(Ordering::SeqCst), 4);
        assert_eq!(pod_listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lingering_config_pods_time_out_the_kill() {
        let listings = Arc::new(AtomicU32::new(0));
        let l = listings.clone();
        let mut mock = MockClusterClient::new();
        mock.expect_list_jobs().returning(move |_, _| {
            if l.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![Job {
                    metadata: ObjectMeta {
                        name: Some("config-vqfx1".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                }])
            } else {
                Ok(vec![])
            }
        });
        mock.expect_delete_job().returning(|_, _| Ok(()));
        mock.expect_list_pods()
            .returning(|_, _| Ok(vec![Pod::default()]));

        let err = configurator(mock)
            .kill_config_jobs("antidote-ll-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn unknown_stage_is_a_validation_error() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
        mock.expect_create_job().never();

        let ll = LiveLesson {
            stage: 7,
            ..live_lesson()
        };
        let err = configurator(mock)
            .configure(&lesson(), &ll)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
