//! Lifecycle orchestration
//!
//! [`AntidoteBackend`] composes the provisioner, the reachability prober and
//! the configurator into the CREATE, MODIFY and DELETE workflows, and owns
//! the garbage-collection sweeps that reuse the same deletion path.
//!
//! Status moves `INITIALIZED -> BOOTING -> CONFIGURATION -> READY`. A failed
//! step sets the lab's `error` flag and leaves `status` where it stalled.
//! Every workflow on a lab runs under that lab's lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use antidote_common::models::{
    Lesson, LessonScheduleRequest, LiveLesson, LiveLessonStatus, OperationType,
};
use antidote_common::store::DataStore;
use antidote_common::{Error, Result};

use crate::cluster::ClusterClient;
use crate::config::SchedulerConfig;
use crate::configurator::Configurator;
use crate::gc::is_expired;
use crate::health::{HealthChecker, Prober};
use crate::locks::LabLocks;
use crate::provisioner::Provisioner;

/// Drives lab lifecycles against the cluster and the data store
pub struct AntidoteBackend {
    store: Arc<dyn DataStore>,
    provisioner: Provisioner,
    prober: Prober,
    configurator: Configurator,
    locks: LabLocks,
    config: Arc<SchedulerConfig>,
}

impl AntidoteBackend {
    /// Wire a backend from its collaborators
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        checker: Arc<dyn HealthChecker>,
        store: Arc<dyn DataStore>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        Self {
            provisioner: Provisioner::new(cluster.clone(), config.clone()),
            prober: Prober::new(checker, store.clone(), &config.timings),
            configurator: Configurator::new(cluster, store.clone(), config.clone()),
            locks: LabLocks::new(),
            store,
            config,
        }
    }

    /// Route a request to the handler for its operation
    pub async fn handle(&self, req: &LessonScheduleRequest) -> Result<()> {
        match req.operation {
            OperationType::Create => self.handle_request_create(req).await,
            OperationType::Modify => self.handle_request_modify(req).await,
            OperationType::Delete => self.handle_request_delete(req).await,
            OperationType::Boop => self.handle_request_boop(req).await,
        }
    }

    /// Provision a lab, wait for it to be reachable, configure it, mark it ready
    #[instrument(skip(self, req), fields(live_lesson = %req.live_lesson_id, lesson = %req.lesson_slug))]
    pub async fn handle_request_create(&self, req: &LessonScheduleRequest) -> Result<()> {
        let _guard = self.locks.lock(&req.live_lesson_id).await;
        let now = Utc::now();

        let lesson = self.store.get_lesson(&req.lesson_slug).await?;
        let ll = match self.store.get_live_lesson(&req.live_lesson_id).await {
            Ok(ll) => ll,
            Err(e) if e.is_not_found() => {
                let ll = LiveLesson::from_request(req, &lesson, now);
                self.store.create_live_lesson(ll.clone()).await?;
                debug!("live lesson record created");
                ll
            }
            Err(e) => return Err(e),
        };

        match ll.status {
            LiveLessonStatus::Initialized => {}
            LiveLessonStatus::Ready if !ll.error => {
                info!("lab already ready, nothing to do");
                return Ok(());
            }
            status => {
                return Err(Error::validation_for(
                    &ll.id,
                    format!("cannot create a lab already in {} state", status),
                ));
            }
        }

        let result = self.create_workflow(&lesson, &ll, now).await;
        self.flag_failure(&ll.id, result).await
    }

    async fn create_workflow(&self, lesson: &Lesson, ll: &LiveLesson, now: DateTime<Utc>) -> Result<()> {
        let lab = self.provisioner.create_lab(lesson, ll, now).await?;
        for (endpoint, addr) in &lab.service_addresses {
            self.store
                .update_live_lesson_endpoint_ip(&ll.id, endpoint, addr)
                .await?;
        }
        self.advance(&ll.id, LiveLessonStatus::Booting).await?;

        // Re-read so the prober dials the addresses just recorded
        let ll = self.store.get_live_lesson(&ll.id).await?;
        if let Err(e) = self.prober.wait_until_reachable(&ll).await {
            if let Error::Unreachable { endpoints, .. } = &e {
                for endpoint in endpoints {
                    let logs = self
                        .provisioner
                        .capture_pod_logs(&lab.namespace, endpoint)
                        .await;
                    warn!(endpoint = %endpoint, logs = %logs, "endpoint never became reachable");
                }
            }
            return Err(e);
        }

        self.configure_and_finish(lesson, &ll.id).await
    }

    /// Reconfigure an existing lab for the requested stage
    #[instrument(skip(self, req), fields(live_lesson = %req.live_lesson_id, stage = req.stage))]
    pub async fn handle_request_modify(&self, req: &LessonScheduleRequest) -> Result<()> {
        let _guard = self.locks.lock(&req.live_lesson_id).await;
        let id = req.live_lesson_id.as_str();

        let ll = self.store.get_live_lesson(id).await?;
        if !matches!(
            ll.status,
            LiveLessonStatus::Ready | LiveLessonStatus::Configuration
        ) {
            return Err(Error::validation_for(
                id,
                format!("cannot modify a lab in {} state", ll.status),
            ));
        }
        let lesson = self.store.get_lesson(&ll.lesson_slug).await?;

        self.store.update_live_lesson_stage(id, req.stage).await?;
        self.store.touch_live_lesson(id, Utc::now()).await?;
        self.store.update_live_lesson_error(id, false).await?;

        let result = self.configure_and_finish(&lesson, id).await;
        self.flag_failure(id, result).await
    }

    async fn configure_and_finish(&self, lesson: &Lesson, id: &str) -> Result<()> {
        let ll = self.store.get_live_lesson(id).await?;
        // A MODIFY retrying a failed reconfiguration is already there
        if ll.status != LiveLessonStatus::Configuration {
            self.advance(id, LiveLessonStatus::Configuration).await?;
        }
        self.configurator.configure(lesson, &ll).await?;

        if lesson.ready_delay > 0 {
            debug!(seconds = lesson.ready_delay, "waiting for endpoints to settle");
            tokio::time::sleep(Duration::from_secs(lesson.ready_delay)).await;
        }

        self.advance(id, LiveLessonStatus::Ready).await?;
        info!(live_lesson = %id, "lab ready");
        Ok(())
    }

    /// Tear a lab down and remove its record
    #[instrument(skip(self, req), fields(live_lesson = %req.live_lesson_id))]
    pub async fn handle_request_delete(&self, req: &LessonScheduleRequest) -> Result<()> {
        self.delete_live_lesson(&req.live_lesson_id).await
    }

    /// Refresh a lab's last activity
    #[instrument(skip(self, req), fields(live_lesson = %req.live_lesson_id))]
    pub async fn handle_request_boop(&self, req: &LessonScheduleRequest) -> Result<()> {
        self.store
            .touch_live_lesson(&req.live_lesson_id, Utc::now())
            .await
    }

    /// Delete the cluster resources of a lab, then its record
    async fn delete_live_lesson(&self, id: &str) -> Result<()> {
        let guard = self.locks.lock(id).await;
        let result = self.delete_locked(id).await;
        drop(guard);
        self.locks.forget(id);
        result
    }

    /// Deletion proper; the caller holds the lab's lock
    ///
    /// The record is removed even when cluster deletion fails so the two
    /// never drift apart silently; the cluster error is still returned.
    async fn delete_locked(&self, id: &str) -> Result<()> {
        let result = self.provisioner.delete_lab(id).await;
        if let Err(e) = &result {
            error!(live_lesson = %id, error = %e, "lab deletion failed, removing record anyway");
        }
        self.store.delete_live_lesson(id).await?;
        info!(live_lesson = %id, "live lesson deleted");
        result
    }

    /// Delete a lab picked by the sweep if it is still idle once locked
    ///
    /// A BOOP or MODIFY may have landed between the sweep's listing and the
    /// lock, so the record is read again under the lock.
    async fn prune_if_still_expired(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let guard = self.locks.lock(id).await;
        let result = self.prune_locked(id, now).await;
        drop(guard);
        self.locks.forget(id);
        result
    }

    async fn prune_locked(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let ll = match self.store.get_live_lesson(id).await {
            Ok(ll) => ll,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !self.is_prunable(&ll, now).await? {
            debug!(live_lesson = %id, "lab active again, keeping");
            return Ok(());
        }
        self.delete_locked(id).await
    }

    /// Delete every lab namespace owned by this instance
    ///
    /// Run at startup, before any request is served.
    #[instrument(skip(self))]
    pub async fn prune_orphans(&self) -> Result<()> {
        let namespaces = self.provisioner.list_lab_namespaces().await?;
        if namespaces.is_empty() {
            debug!("no orphaned lab namespaces");
            return Ok(());
        }
        info!(count = namespaces.len(), "deleting orphaned lab namespaces");

        let results = join_all(
            namespaces
                .iter()
                .map(|ns| self.provisioner.delete_namespace(ns)),
        )
        .await;
        first_error(results)
    }

    /// Delete labs idle for longer than the configured TTL
    pub async fn prune_old_live_lessons(&self) -> Result<()> {
        self.prune_old_live_lessons_at(Utc::now()).await
    }

    /// [`Self::prune_old_live_lessons`] against an explicit clock
    #[instrument(skip(self))]
    pub async fn prune_old_live_lessons_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut expired = Vec::new();
        for ll in self.store.list_live_lessons().await? {
            if self.is_prunable(&ll, now).await? {
                expired.push(ll.id);
            }
        }

        if expired.is_empty() {
            return Ok(());
        }
        info!(count = expired.len(), "pruning idle live lessons");
        let results = join_all(
            expired
                .iter()
                .map(|id| self.prune_if_still_expired(id, now)),
        )
        .await;
        first_error(results)
    }

    /// Delete sessions older than the configured TTL that own no lab
    pub async fn prune_old_live_sessions(&self) -> Result<()> {
        self.prune_old_live_sessions_at(Utc::now()).await
    }

    /// [`Self::prune_old_live_sessions`] against an explicit clock
    #[instrument(skip(self))]
    pub async fn prune_old_live_sessions_at(&self, now: DateTime<Utc>) -> Result<()> {
        for session in self.store.list_live_sessions().await? {
            if session.persistent
                || !is_expired(session.created_time, now, self.config.live_session_ttl)
            {
                continue;
            }
            if !self
                .store
                .get_live_lessons_for_session(&session.id)
                .await?
                .is_empty()
            {
                debug!(session = %session.id, "keeping session that still owns labs");
                continue;
            }
            self.store.delete_live_session(&session.id).await?;
            info!(session = %session.id, "pruned idle live session");
        }
        Ok(())
    }

    /// Idle past the TTL and not owned by a persistent session
    async fn is_prunable(&self, ll: &LiveLesson, now: DateTime<Utc>) -> Result<bool> {
        if !is_expired(ll.last_active_time, now, self.config.live_lesson_ttl) {
            return Ok(false);
        }
        if self.session_is_persistent(&ll.session_id).await? {
            debug!(live_lesson = %ll.id, session = %ll.session_id, "keeping lab of persistent session");
            return Ok(false);
        }
        Ok(true)
    }

    async fn session_is_persistent(&self, session_id: &str) -> Result<bool> {
        match self.store.get_live_session(session_id).await {
            Ok(session) => Ok(session.persistent),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move a lab to `next`, refusing transitions the lifecycle does not allow
    async fn advance(&self, id: &str, next: LiveLessonStatus) -> Result<()> {
        let current = self.store.get_live_lesson(id).await?.status;
        if !current.can_transition_to(next) {
            return Err(Error::internal_with_context(
                id,
                format!("illegal status transition {} -> {}", current, next),
            ));
        }
        self.store.update_live_lesson_status(id, next).await?;
        debug!(live_lesson = %id, from = %current, to = %next, "status changed");
        Ok(())
    }

    /// Set the error flag when a workflow failed, then pass the result through
    async fn flag_failure(&self, id: &str, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            error!(live_lesson = %id, error = %e, "workflow failed");
            if let Err(flag_err) = self.store.update_live_lesson_error(id, true).await {
                error!(live_lesson = %id, error = %flag_err, "failed to set error flag");
            }
        }
        result
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    let mut errors = results.into_iter().filter_map(|r| r.err());
    match errors.next() {
        Some(first) => {
            for other in errors {
                error!(error = %other, "additional deletion failure");
            }
            Err(first)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use k8s_openapi::api::batch::v1::{Job, JobStatus};
    use k8s_openapi::api::core::v1::{ContainerStatus, Namespace, Pod, PodStatus, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use antidote_common::models::{
        Image, LessonEndpoint, LessonStage, LiveSession, Presentation, PresentationType,
    };
    use antidote_common::store::InMemoryDataStore;

    use crate::cluster::MockClusterClient;
    use crate::config::Timings;
    use crate::health::MockHealthChecker;

    fn named<T>(name: &str, f: impl FnOnce(ObjectMeta) -> T) -> T {
        f(ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        })
    }

    fn running_pod() -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Running".into()),
                container_statuses: Some(vec![ContainerStatus {
                    ready: true,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn lesson() -> Lesson {
        let ssh = Presentation {
            name: "cli".into(),
            port: 22,
            type_: PresentationType::Ssh,
        };
        Lesson {
            slug: "valid-lesson".into(),
            lesson_dir: "lessons/valid-lesson".into(),
            endpoints: vec![
                LessonEndpoint {
                    name: "vqfx1".into(),
                    image: "vqfx".into(),
                    configuration_type: Some("napalm".into()),
                    presentations: vec![ssh.clone()],
                    ..Default::default()
                },
                LessonEndpoint {
                    name: "vqfx2".into(),
                    image: "vqfx".into(),
                    configuration_type: Some("napalm".into()),
                    presentations: vec![ssh],
                    ..Default::default()
                },
                LessonEndpoint {
                    name: "linux1".into(),
                    image: "utility".into(),
                    additional_ports: vec![22],
                    ..Default::default()
                },
            ],
            stages: vec![
                LessonStage::default(),
                LessonStage {
                    configs: vec!["vqfx1.txt".into(), "vqfx2.txt".into()],
                    ..Default::default()
                },
                LessonStage {
                    configs: vec!["vqfx1.txt".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn store() -> Arc<InMemoryDataStore> {
        let store = Arc::new(InMemoryDataStore::new());
        store.insert_lesson(lesson());
        store.insert_image(Image {
            name: "vqfx".into(),
            ssh_user: "antidote".into(),
            ssh_password: "antidotepassword".into(),
            napalm_driver: Some("junos".into()),
        });
        store
    }

    fn request(operation: OperationType, stage: u32) -> LessonScheduleRequest {
        LessonScheduleRequest {
            operation,
            lesson_slug: "valid-lesson".into(),
            live_lesson_id: "ll-1".into(),
            live_session_id: "abcdef".into(),
            stage,
            created: Utc::now(),
        }
    }

    type Created = Arc<Mutex<Vec<String>>>;

    /// A cluster where everything succeeds
    fn healthy_cluster(created: &Created) -> MockClusterClient {
        let mut mock = MockClusterClient::new();
        let c = created.clone();
        mock.expect_create_namespace().returning(move |ns| {
            c.lock().unwrap().push(ns.metadata.name.clone().unwrap());
            Ok(ns.clone())
        });
        mock.expect_create_network_policy()
            .returning(|_, np| Ok(np.clone()));
        mock.expect_get_secret()
            .returning(|_, name| Ok(Some(named(name, |metadata| Secret { metadata, ..Default::default() }))));
        mock.expect_create_secret().returning(|_, s| Ok(s.clone()));
        mock.expect_create_network().returning(|_, n| Ok(n.clone()));
        let c = created.clone();
        mock.expect_create_pod().returning(move |_, p| {
            c.lock().unwrap().push(format!("pod/{}", p.metadata.name.clone().unwrap()));
            Ok(p.clone())
        });
        mock.expect_create_service().returning(|_, s| {
            let mut s = s.clone();
            let name = s.metadata.name.clone().unwrap();
            if let Some(spec) = s.spec.as_mut() {
                spec.cluster_ip = Some(format!("10.96.0.{}", name.len()));
            }
            Ok(s)
        });
        mock.expect_create_ingress().returning(|_, i| Ok(i.clone()));
        mock.expect_get_pod()
            .returning(|_, _| Ok(Some(running_pod())));
        mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
        mock.expect_create_job().returning(|_, j| Ok(j.clone()));
        mock.expect_get_job().returning(|_, _| {
            Ok(Some(Job {
                status: Some(JobStatus {
                    succeeded: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        mock
    }

    fn all_reachable() -> MockHealthChecker {
        let mut checker = MockHealthChecker::new();
        checker.expect_check().returning(|_| true);
        checker
    }

    fn backend(
        cluster: MockClusterClient,
        checker: MockHealthChecker,
        store: Arc<InMemoryDataStore>,
    ) -> AntidoteBackend {
        AntidoteBackend::new(
            Arc::new(cluster),
            Arc::new(checker),
            store,
            Arc::new(SchedulerConfig {
                timings: Timings::fast(),
                ..Default::default()
            }),
        )
    }

    /// Story: a CREATE for valid-lesson stage 1 ends READY with every test healthy
    #[tokio::test]
    async fn story_create_end_to_end() {
        let created: Created = Default::default();
        let store = store();
        let b = backend(healthy_cluster(&created), all_reachable(), store.clone());

        b.handle(&request(OperationType::Create, 1)).await.unwrap();

        let created = created.lock().unwrap().clone();
        assert_eq!(
            created,
            vec!["antidote-ll-1", "pod/vqfx1", "pod/vqfx2", "pod/linux1"]
        );

        let ll = store.get_live_lesson("ll-1").await.unwrap();
        assert_eq!(ll.status, LiveLessonStatus::Ready);
        assert!(!ll.error);
        assert_eq!(ll.session_id, "abcdef");
        assert_eq!(ll.total_test_count, 3);
        assert_eq!(ll.healthy_test_count, ll.total_test_count);
        assert_eq!(ll.live_endpoints["vqfx1"].host, "10.96.0.5");
    }

    /// Story: observers see each status exactly once, in lifecycle order
    #[tokio::test]
    async fn story_status_only_moves_forward() {
        let store = store();
        let b = backend(healthy_cluster(&Default::default()), all_reachable(), store.clone());

        b.handle(&request(OperationType::Create, 1)).await.unwrap();

        use LiveLessonStatus::*;
        assert_eq!(
            store.status_history("ll-1"),
            vec![Initialized, Booting, Configuration, Ready]
        );
    }

    /// Story: an endpoint that never answers leaves the lab in BOOTING with
    /// the error flag set
    #[tokio::test]
    async fn story_unreachable_lab_stalls_in_booting() {
        let store = store();
        let mut cluster = healthy_cluster(&Default::default());
        cluster
            .expect_pod_logs()
            .returning(|_, pod, container| Ok(format!("{}/{}", pod, container)));

        let mut checker = MockHealthChecker::new();
        checker
            .expect_check()
            .returning(|test| test.endpoint != "vqfx2");

        let b = backend(cluster, checker, store.clone());
        let err = b
            .handle(&request(OperationType::Create, 1))
            .await
            .unwrap_err();
        match err {
            Error::Unreachable { endpoints, .. } => assert_eq!(endpoints, vec!["vqfx2"]),
            other => panic!("expected unreachable, got {other:?}"),
        }

        let ll = store.get_live_lesson("ll-1").await.unwrap();
        assert_eq!(ll.status, LiveLessonStatus::Booting);
        assert!(ll.error);
        assert_eq!(ll.healthy_test_count, 2);
        assert_eq!(ll.total_test_count, 3);
    }

    #[tokio::test]
    async fn failed_provisioning_keeps_initialized_status() {
        let store = store();
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_create_namespace()
            .returning(|ns| Ok(ns.clone()));
        cluster
            .expect_create_network_policy()
            .returning(|_, np| Ok(np.clone()));
        cluster.expect_get_secret().returning(|_, _| Ok(None));

        let b = backend(cluster, MockHealthChecker::new(), store.clone());
        let err = b
            .handle(&request(OperationType::Create, 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let ll = store.get_live_lesson("ll-1").await.unwrap();
        assert_eq!(ll.status, LiveLessonStatus::Initialized);
        assert!(ll.error);
    }

    /// Story: MODIFY reconfigures for the new stage without revisiting BOOTING
    #[tokio::test]
    async fn story_modify_reenters_configuration() {
        let store = store();
        let b = backend(healthy_cluster(&Default::default()), all_reachable(), store.clone());

        b.handle(&request(OperationType::Create, 1)).await.unwrap();
        b.handle(&request(OperationType::Modify, 2)).await.unwrap();

        use LiveLessonStatus::*;
        assert_eq!(
            store.status_history("ll-1"),
            vec![Initialized, Booting, Configuration, Ready, Configuration, Ready]
        );
        let ll = store.get_live_lesson("ll-1").await.unwrap();
        assert_eq!(ll.stage, 2);
        assert!(!ll.error);
    }

    #[tokio::test]
    async fn modify_of_unknown_lab_fails() {
        let b = backend(MockClusterClient::new(), MockHealthChecker::new(), store());
        let err = b
            .handle(&request(OperationType::Modify, 2))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: the record is removed even when the cluster refuses the delete
    #[tokio::test]
    async fn story_delete_always_removes_record() {
        let store = store();
        store
            .create_live_lesson(LiveLesson::from_request(
                &request(OperationType::Create, 1),
                &lesson(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_delete_namespace()
            .returning(|_| Err(Error::internal("apiserver unavailable")));

        let b = backend(cluster, MockHealthChecker::new(), store.clone());
        assert!(b.handle(&request(OperationType::Delete, 1)).await.is_err());
        assert!(store.get_live_lesson("ll-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn boop_refreshes_last_activity_only() {
        let store = store();
        let old = Utc::now() - chrono::Duration::hours(1);
        store
            .create_live_lesson(LiveLesson::from_request(
                &request(OperationType::Create, 1),
                &lesson(),
                old,
            ))
            .await
            .unwrap();

        let b = backend(MockClusterClient::new(), MockHealthChecker::new(), store.clone());
        b.handle(&request(OperationType::Boop, 1)).await.unwrap();

        let ll = store.get_live_lesson("ll-1").await.unwrap();
        assert!(ll.last_active_time > old);
        assert_eq!(ll.created_time, old);
        assert_eq!(ll.status, LiveLessonStatus::Initialized);
    }

    fn lab(id: &str, session: &str, last_active: DateTime<Utc>) -> LiveLesson {
        let req = LessonScheduleRequest {
            live_lesson_id: id.into(),
            live_session_id: session.into(),
            ..request(OperationType::Create, 1)
        };
        let mut ll = LiveLesson::from_request(&req, &lesson(), last_active);
        ll.status = LiveLessonStatus::Ready;
        ll
    }

    fn session(id: &str, persistent: bool, created: DateTime<Utc>) -> LiveSession {
        LiveSession {
            id: id.into(),
            source_ip: "192.0.2.1".into(),
            persistent,
            created_time: created,
        }
    }

    /// A cluster whose namespaces vanish as soon as they are deleted
    fn deleting_cluster(deleted: &Created) -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        let d = deleted.clone();
        cluster.expect_delete_namespace().returning(move |ns| {
            d.lock().unwrap().push(ns.to_string());
            Ok(())
        });
        cluster.expect_get_namespace().returning(|_| Ok(None));
        cluster
    }

    /// Story: idle labs are pruned unless their session is persistent, and
    /// the boundary itself is not idle enough
    #[tokio::test]
    async fn story_lab_expiry_respects_persistence_and_boundary() {
        let now = Utc::now();
        let ttl = SchedulerConfig::default().live_lesson_ttl;
        let at_boundary = now - chrono::Duration::from_std(ttl).unwrap();
        let past_boundary = at_boundary - chrono::Duration::microseconds(1);

        let store = store();
        store.create_live_session(session("s-temp", false, now)).await.unwrap();
        store.create_live_session(session("s-keep", true, now)).await.unwrap();
        store.create_live_lesson(lab("ll-old", "s-temp", past_boundary)).await.unwrap();
        store.create_live_lesson(lab("ll-edge", "s-temp", at_boundary)).await.unwrap();
        store.create_live_lesson(lab("ll-kept", "s-keep", past_boundary)).await.unwrap();
        store.create_live_lesson(lab("ll-orphan", "s-gone", past_boundary)).await.unwrap();

        let deleted: Created = Default::default();
        let b = backend(deleting_cluster(&deleted), MockHealthChecker::new(), store.clone());
        b.prune_old_live_lessons_at(now).await.unwrap();

        let deleted: BTreeSet<_> = deleted.lock().unwrap().iter().cloned().collect();
        assert_eq!(
            deleted,
            BTreeSet::from(["antidote-ll-old".to_string(), "antidote-ll-orphan".to_string()])
        );
        let remaining: BTreeSet<_> = store
            .list_live_lessons()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(
            remaining,
            BTreeSet::from(["ll-edge".to_string(), "ll-kept".to_string()])
        );
    }

    /// Story: a lab BOOPed while the sweep waits on its lock survives the
    /// sweep, and so does one whose session turned persistent meanwhile
    #[tokio::test]
    async fn story_lab_revived_during_sweep_is_kept() {
        let now = Utc::now();
        let idle = now - chrono::Duration::hours(2);

        let store = store();
        store.create_live_session(session("s-temp", false, now)).await.unwrap();
        store.create_live_session(session("s-late", false, now)).await.unwrap();
        store.create_live_lesson(lab("ll-old", "s-temp", idle)).await.unwrap();
        store.create_live_lesson(lab("ll-saved", "s-late", idle)).await.unwrap();

        // no delete expectations: any cluster deletion fails the test
        let b = Arc::new(backend(MockClusterClient::new(), MockHealthChecker::new(), store.clone()));
        let held = b.locks.lock("ll-old").await;
        let held_too = b.locks.lock("ll-saved").await;
        let sweep = {
            let b = b.clone();
            tokio::spawn(async move { b.prune_old_live_lessons_at(now).await })
        };
        // let the sweep pick both labs and queue on their locks
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        store.touch_live_lesson("ll-old", Utc::now()).await.unwrap();
        store.delete_live_session("s-late").await.unwrap();
        store.create_live_session(session("s-late", true, now)).await.unwrap();
        drop(held);
        drop(held_too);

        sweep.await.unwrap().unwrap();
        assert!(store.get_live_lesson("ll-old").await.is_ok());
        assert!(store.get_live_lesson("ll-saved").await.is_ok());
    }

    /// Story: old sessions go away only when not persistent and owning no lab
    #[tokio::test]
    async fn story_session_expiry_respects_persistence_and_ownership() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(2);

        let store = store();
        store.create_live_session(session("s-old", false, old)).await.unwrap();
        store.create_live_session(session("s-persistent", true, old)).await.unwrap();
        store.create_live_session(session("s-busy", false, old)).await.unwrap();
        store.create_live_session(session("s-new", false, now)).await.unwrap();
        store.create_live_lesson(lab("ll-1", "s-busy", now)).await.unwrap();

        let b = backend(MockClusterClient::new(), MockHealthChecker::new(), store.clone());
        b.prune_old_live_sessions_at(now).await.unwrap();

        let remaining: BTreeSet<_> = store
            .list_live_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(
            remaining,
            BTreeSet::from([
                "s-busy".to_string(),
                "s-new".to_string(),
                "s-persistent".to_string()
            ])
        );
    }

    /// Story: sweeping orphans twice in a row succeeds both times and leaves
    /// nothing behind
    #[tokio::test]
    async fn story_orphan_sweep_is_idempotent() {
        let namespaces = Arc::new(Mutex::new(BTreeSet::from([
            "antidote-ll-1".to_string(),
            "antidote-ll-2".to_string(),
        ])));

        let mut cluster = MockClusterClient::new();
        let n = namespaces.clone();
        cluster
            .expect_list_namespaces()
            .withf(|selector| selector.contains("antidote.dev/instance=antidote"))
            .returning(move |_| {
                Ok(n.lock()
                    .unwrap()
                    .iter()
                    .map(|name| named(name, |metadata| Namespace { metadata, ..Default::default() }))
                    .collect())
            });
        let n = namespaces.clone();
        cluster.expect_delete_namespace().returning(move |name| {
            n.lock().unwrap().remove(name);
            Ok(())
        });
        let n = namespaces.clone();
        cluster.expect_get_namespace().returning(move |name| {
            Ok(n.lock()
                .unwrap()
                .contains(name)
                .then(|| named(name, |metadata| Namespace { metadata, ..Default::default() })))
        });

        let b = backend(cluster, MockHealthChecker::new(), store());
        b.prune_orphans().await.unwrap();
        assert!(namespaces.lock().unwrap().is_empty());
        b.prune_orphans().await.unwrap();
        assert!(namespaces.lock().unwrap().is_empty());
    }

    /// Story: a DELETE arriving during a CREATE waits for it to finish
    #[tokio::test]
    async fn story_delete_waits_for_inflight_create() {
        let store = store();
        let events: Created = Default::default();

        let mut cluster = healthy_cluster(&events);
        let e = events.clone();
        cluster.expect_delete_namespace().returning(move |_| {
            e.lock().unwrap().push("delete".into());
            Ok(())
        });
        cluster.expect_get_namespace().returning(|_| Ok(None));

        let b = Arc::new(backend(cluster, all_reachable(), store.clone()));
        let create = {
            let b = b.clone();
            tokio::spawn(async move { b.handle(&request(OperationType::Create, 1)).await })
        };
        // let the CREATE take the lock first
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        b.handle(&request(OperationType::Delete, 1)).await.unwrap();
        create.await.unwrap().unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("antidote-ll-1"));
        assert_eq!(events.last().map(String::as_str), Some("delete"));
        assert!(store.get_live_lesson("ll-1").await.unwrap_err().is_not_found());
    }
}
