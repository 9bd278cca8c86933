//! Cluster orchestration seam
//!
//! [`ClusterClient`] is everything the scheduler asks of Kubernetes. The
//! workflow code only ever talks to this trait, so tests drive it with
//! `MockClusterClient` and production wires [`KubeClusterClient`].
//!
//! Conventions shared by every method:
//! - `get_*` maps a 404 to `Ok(None)`
//! - `delete_*` maps a 404 to `Ok(())`, so deletes are idempotent
//! - `create_*` propagates a 409 unchanged; callers decide what "already
//!   exists" means for them

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use antidote_common::kube_utils::HasApiResource;
use antidote_common::{Error, Result};

use crate::resources::NetworkAttachmentDefinition;

/// Lines of log kept when capturing diagnostics
const LOG_TAIL_LINES: i64 = 200;

/// Kubernetes operations used by the scheduler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // Namespaces

    /// Create a namespace
    async fn create_namespace(&self, ns: &Namespace) -> Result<Namespace>;
    /// Get a namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    /// Delete a namespace and, by cascade, everything in it
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    /// List namespaces matching a label selector
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>>;

    // Network policies

    /// Create a network policy
    async fn create_network_policy(&self, namespace: &str, np: &NetworkPolicy)
        -> Result<NetworkPolicy>;
    /// Get a network policy
    async fn get_network_policy(&self, namespace: &str, name: &str)
        -> Result<Option<NetworkPolicy>>;
    /// Delete a network policy
    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()>;
    /// List network policies matching a label selector
    async fn list_network_policies(&self, namespace: &str, selector: &str)
        -> Result<Vec<NetworkPolicy>>;

    // Secrets

    /// Create a secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;
    /// Get a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    /// Delete a secret
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
    /// List secrets matching a label selector
    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>>;

    // Virtual networks

    /// Create a network attachment definition
    async fn create_network(
        &self,
        namespace: &str,
        network: &NetworkAttachmentDefinition,
    ) -> Result<NetworkAttachmentDefinition>;
    /// Get a network attachment definition
    async fn get_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>>;
    /// Delete a network attachment definition
    async fn delete_network(&self, namespace: &str, name: &str) -> Result<()>;
    /// List network attachment definitions matching a label selector
    async fn list_networks(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<NetworkAttachmentDefinition>>;

    // Pods

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;
    /// Get a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;
    /// Tail of one container's log
    async fn pod_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String>;

    // Services

    /// Create a service
    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service>;
    /// Get a service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    /// Delete a service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;
    /// List services matching a label selector
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>>;

    // Ingresses

    /// Create an ingress
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;
    /// Get an ingress
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>>;
    /// Delete an ingress
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()>;
    /// List ingresses matching a label selector
    async fn list_ingresses(&self, namespace: &str, selector: &str) -> Result<Vec<Ingress>>;

    // Jobs

    /// Create a job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;
    /// Get a job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;
    /// Delete a job along with its pods, the pods going first
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
    /// List jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>>;
}

/// [`ClusterClient`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_in<K>(&self, namespace: &str, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let created = self
            .api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await?;
        debug!(
            kind = %K::kind(&()),
            name = ?created.meta().name,
            namespace = %namespace,
            "created resource"
        );
        Ok(created)
    }

    async fn get_in<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn delete_in<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        self.delete_in_with::<K>(namespace, name, &DeleteParams::background())
            .await
    }

    async fn delete_in_with<K>(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        match self.api::<K>(namespace).delete(name, params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_in<K>(&self, namespace: &str, selector: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    fn network_api(&self, namespace: &str) -> Api<DynamicObject> {
        let ar = NetworkAttachmentDefinition::api_resource();
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

fn to_network(obj: DynamicObject) -> Result<NetworkAttachmentDefinition> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_namespace(&self, ns: &Namespace) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), ns).await?)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        np: &NetworkPolicy,
    ) -> Result<NetworkPolicy> {
        self.create_in(namespace, np).await
    }

    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>> {
        self.get_in(namespace, name).await
    }

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_in::<NetworkPolicy>(namespace, name).await
    }

    async fn list_network_policies(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<NetworkPolicy>> {
        self.list_in(namespace, selector).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        self.create_in(namespace, secret).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_in(namespace, name).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_in::<Secret>(namespace, name).await
    }

    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>> {
        self.list_in(namespace, selector).await
    }

    async fn create_network(
        &self,
        namespace: &str,
        network: &NetworkAttachmentDefinition,
    ) -> Result<NetworkAttachmentDefinition> {
        let obj: DynamicObject = serde_json::from_value(serde_json::to_value(network)?)?;
        let created = self
            .network_api(namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        to_network(created)
    }

    async fn get_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkAttachmentDefinition>> {
        self.network_api(namespace)
            .get_opt(name)
            .await?
            .map(to_network)
            .transpose()
    }

    async fn delete_network(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .network_api(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_networks(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<NetworkAttachmentDefinition>> {
        self.network_api(namespace)
            .list(&ListParams::default().labels(selector))
            .await?
            .items
            .into_iter()
            .map(to_network)
            .collect()
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.create_in(namespace, pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get_in(namespace, name).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_in::<Pod>(namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        self.list_in(namespace, selector).await
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(LOG_TAIL_LINES),
            ..Default::default()
        };
        Ok(self.api::<Pod>(namespace).logs(pod, &params).await?)
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service> {
        self.create_in(namespace, svc).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get_in(namespace, name).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_in::<Service>(namespace, name).await
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        self.list_in(namespace, selector).await
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        self.create_in(namespace, ingress).await
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>> {
        self.get_in(namespace, name).await
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_in::<Ingress>(namespace, name).await
    }

    async fn list_ingresses(&self, namespace: &str, selector: &str) -> Result<Vec<Ingress>> {
        self.list_in(namespace, selector).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        self.create_in(namespace, job).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.get_in(namespace, name).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        // Foreground: the job object outlives its pods
        self.delete_in_with::<Job>(namespace, name, &DeleteParams::foreground())
            .await
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>> {
        self.list_in(namespace, selector).await
    }
}

/// Turn "already exists" into success, yielding the object that was going to be created
///
/// The existing object governs cleanup, so the caller carries on with its own
/// copy rather than fetching the live one.
pub fn tolerate_existing<K>(result: Result<K>, intended: K) -> Result<K> {
    match result {
        Ok(created) => Ok(created),
        Err(e) if e.is_already_exists() => {
            debug!(error = %e, "resource already exists, continuing");
            Ok(intended)
        }
        Err(e) => Err(e),
    }
}

/// Fail with [`Error::NotFound`] when an optional lookup came back empty
pub(crate) fn required<K>(value: Option<K>, kind: &str, name: &str) -> Result<K> {
    value.ok_or_else(|| Error::not_found(kind, name))
}
