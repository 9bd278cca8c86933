//! Lab provisioning and teardown
//!
//! A lab is one namespace holding everything it needs. Creation runs as a
//! strict sequence: namespace, egress policy, secrets, networks, pods in
//! declared endpoint order, services, ingress routes, then a concurrent
//! wait for every pod to start. Teardown deletes the namespace and waits
//! for the cascade to finish.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, instrument, warn};

use antidote_common::kube_utils::poll_until;
use antidote_common::models::{Lesson, LessonEndpoint, LiveLesson, PresentationType};
use antidote_common::{Error, Result};

use crate::cluster::{required, tolerate_existing, ClusterClient};
use crate::config::SchedulerConfig;
use crate::resources::{
    build_ingress, build_namespace, build_network_policy, build_networks, build_pod,
    build_service, copy_secret, instance_selector, namespace_name, pod_ready,
    CURRICULUM_SYNC_CONTAINER,
};

/// Result of a successful lab creation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionedLab {
    /// Namespace holding the lab
    pub namespace: String,
    /// Service address per endpoint, for endpoints that expose ports
    pub service_addresses: BTreeMap<String, String>,
}

/// Creates and deletes the cluster resources of a lab
pub struct Provisioner {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<SchedulerConfig>,
}

impl Provisioner {
    /// Create a provisioner
    pub fn new(cluster: Arc<dyn ClusterClient>, config: Arc<SchedulerConfig>) -> Self {
        Self { cluster, config }
    }

    /// Namespace a lab lives in
    pub fn namespace_for(&self, live_lesson_id: &str) -> String {
        namespace_name(&self.config.instance_id, live_lesson_id)
    }

    /// Create every resource of a lab and wait for its pods to start
    #[instrument(skip(self, lesson, ll, now), fields(live_lesson = %ll.id, lesson = %lesson.slug))]
    pub async fn create_lab(
        &self,
        lesson: &Lesson,
        ll: &LiveLesson,
        now: DateTime<Utc>,
    ) -> Result<ProvisionedLab> {
        let ns = self.namespace_for(&ll.id);

        let namespace = build_namespace(&self.config.instance_id, ll, now);
        tolerate_existing(
            self.cluster.create_namespace(&namespace).await,
            namespace.clone(),
        )?;
        debug!(namespace = %ns, "namespace created");

        if !self.config.allow_egress {
            let policy = build_network_policy(&ns, &ll.id);
            tolerate_existing(
                self.cluster.create_network_policy(&ns, &policy).await,
                policy.clone(),
            )?;
        }

        self.sync_secrets(&ns, &ll.id).await?;

        for network in build_networks(lesson, &ns, &ll.id)? {
            tolerate_existing(
                self.cluster.create_network(&ns, &network).await,
                network.clone(),
            )?;
        }

        // Declared order: IPAM hands out addresses in attach order
        let endpoints = lesson.ordered_endpoints();
        for ep in &endpoints {
            let pod = build_pod(&self.config, lesson, ep, &ns, &ll.id);
            tolerate_existing(self.cluster.create_pod(&ns, &pod).await, pod.clone())?;
        }

        let mut service_addresses = BTreeMap::new();
        for ep in &endpoints {
            if let Some(addr) = self.create_service(&ns, ep, &ll.id).await? {
                service_addresses.insert(ep.name.clone(), addr);
            }
        }

        for ep in &endpoints {
            for pres in ep
                .presentations
                .iter()
                .filter(|p| p.type_ == PresentationType::Http)
            {
                let ingress = build_ingress(&self.config, &ep.name, pres, &ns, &ll.id);
                tolerate_existing(
                    self.cluster.create_ingress(&ns, &ingress).await,
                    ingress.clone(),
                )?;
            }
        }

        self.wait_for_pods(&ns, &endpoints).await?;

        info!(namespace = %ns, endpoints = endpoints.len(), "lab provisioned");
        Ok(ProvisionedLab {
            namespace: ns,
            service_addresses,
        })
    }

    /// Copy the shared TLS and pull secrets into a lab namespace
    async fn sync_secrets(&self, ns: &str, live_lesson_id: &str) -> Result<()> {
        let names = std::iter::once(&self.config.tls_secret_name)
            .chain(self.config.pull_secret_name.as_ref());

        for name in names {
            let source = required(
                self.cluster
                    .get_secret(&self.config.secrets_namespace, name)
                    .await?,
                "Secret",
                name,
            )?;
            let copy = copy_secret(&source, ns, live_lesson_id);
            tolerate_existing(self.cluster.create_secret(ns, &copy).await, copy.clone())?;
        }
        Ok(())
    }

    /// Create an endpoint's service and return its cluster address
    async fn create_service(
        &self,
        ns: &str,
        ep: &LessonEndpoint,
        live_lesson_id: &str,
    ) -> Result<Option<String>> {
        let Some(svc) = build_service(ep, ns, live_lesson_id) else {
            return Ok(None);
        };
        let created = tolerate_existing(self.cluster.create_service(ns, &svc).await, svc)?;

        if let Some(ip) = cluster_ip(&created) {
            return Ok(Some(ip));
        }
        // The intended copy of an existing service has no address yet
        Ok(self
            .cluster
            .get_service(ns, &ep.name)
            .await?
            .as_ref()
            .and_then(cluster_ip))
    }

    /// Wait for every endpoint pod to start, concurrently
    ///
    /// One pod never starting fails the whole wait; its logs are attached.
    async fn wait_for_pods(&self, ns: &str, endpoints: &[LessonEndpoint]) -> Result<()> {
        let timings = &self.config.timings;
        let waits = endpoints.iter().map(|ep| async move {
            let name = ep.name.as_str();
            let result = poll_until(
                timings.pod_ready_timeout,
                timings.pod_ready_poll,
                "pod readiness",
                format!("pod {}/{} never became ready", ns, name),
                || async move {
                    Ok(self
                        .cluster
                        .get_pod(ns, name)
                        .await?
                        .as_ref()
                        .is_some_and(pod_ready))
                },
            )
            .await;

            match result {
                Err(Error::Timeout {
                    operation, message, ..
                }) => {
                    let logs = self.capture_pod_logs(ns, name).await;
                    warn!(namespace = %ns, pod = %name, "pod never became ready");
                    Err(Error::timeout_with_diagnostics(operation, message, logs))
                }
                other => other,
            }
        });

        try_join_all(waits).await?;
        Ok(())
    }

    /// Logs of an endpoint pod's main and curriculum-sync containers
    pub(crate) async fn capture_pod_logs(&self, ns: &str, pod: &str) -> String {
        let mut out = String::new();
        for container in [pod, CURRICULUM_SYNC_CONTAINER] {
            let logs = match self.cluster.pod_logs(ns, pod, container).await {
                Ok(logs) => logs,
                Err(e) => format!("<logs unavailable: {}>", e),
            };
            out.push_str(&format!("--- {}/{} ---\n{}\n", pod, container, logs));
        }
        out
    }

    /// Delete a lab's namespace and wait for it to disappear
    #[instrument(skip(self))]
    pub async fn delete_lab(&self, live_lesson_id: &str) -> Result<()> {
        self.delete_namespace(&self.namespace_for(live_lesson_id))
            .await
    }

    /// Delete a namespace and wait for the cascade to finish
    pub async fn delete_namespace(&self, ns: &str) -> Result<()> {
        match self.cluster.delete_namespace(ns).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(namespace = %ns, "namespace already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let timings = &self.config.timings;
        poll_until(
            timings.namespace_deletion_timeout,
            timings.namespace_deletion_poll,
            "namespace deletion",
            format!("namespace {} still exists", ns),
            || async { Ok(self.cluster.get_namespace(ns).await?.is_none()) },
        )
        .await?;

        info!(namespace = %ns, "namespace deleted");
        Ok(())
    }

    /// Names of every lab namespace owned by this instance
    pub async fn list_lab_namespaces(&self) -> Result<Vec<String>> {
        let namespaces = self
            .cluster
            .list_namespaces(&instance_selector(&self.config.instance_id))
            .await?;
        Ok(namespaces
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }
}

fn cluster_ip(svc: &Service) -> Option<String> {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None")
}
