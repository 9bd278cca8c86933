//! Shared Kubernetes utilities using kube-rs
//!
//! Polling, label-selector and API-resource helpers used by every part of
//! the scheduler that talks to the cluster.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::discovery::ApiResource;
use tracing::trace;

use crate::Error;

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implement this for third-party resource types (Multus networks and the
/// like) that are not part of `k8s-openapi`, so they can be applied through
/// `Api<DynamicObject>` with a consistent apiVersion everywhere.
///
/// # Example
/// ```ignore
/// impl HasApiResource for NetworkAttachmentDefinition {
///     const API_VERSION: &'static str = "k8s.cni.cncf.io/v1";
///     const KIND: &'static str = "NetworkAttachmentDefinition";
/// }
///
/// let ar = NetworkAttachmentDefinition::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "k8s.cni.cncf.io/v1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "NetworkAttachmentDefinition")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion string and kind.
///
/// The plural is derived with [`pluralize_kind`].
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Lowercase plural of a resource kind, as used in API paths
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with("policy") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else if lower.ends_with('s') {
        format!("{}es", lower)
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Labels
// =============================================================================

/// Render a label map as a Kubernetes equality-based label selector
///
/// BTreeMap ordering makes the output deterministic.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a timestamp as a label-safe value (unix seconds)
pub fn timestamp_label(ts: DateTime<Utc>) -> String {
    ts.timestamp().to_string()
}

// =============================================================================
// Polling
// =============================================================================

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` until it returns `Ok(true)`. `Ok(false)` keeps
/// polling; an `Err` is an unrecoverable backend failure and is returned
/// immediately. When the ceiling passes, an [`Error::Timeout`] tagged with
/// `operation` is returned.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    operation: &str,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if check_fn().await? {
            return Ok(());
        }
        trace!(operation, "polling condition not yet met");

        if start.elapsed() + poll_interval > timeout {
            return Err(Error::timeout(operation, timeout_msg));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
