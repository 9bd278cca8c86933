//! Common types for Antidote: lesson model, errors, and collaborator interfaces

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod models;
pub mod store;
pub mod telemetry;
pub mod tracing;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key marking every resource created by Antidote
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value paired with [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_ANTIDOTE: &str = "antidote";

/// Label key carrying the deployment instance identifier
pub const LABEL_INSTANCE_ID: &str = "antidote.dev/instance";

/// Label key carrying the owning LiveLesson ID
pub const LABEL_LIVE_LESSON: &str = "antidote.dev/live-lesson";

/// Label key carrying the owning LiveSession ID
pub const LABEL_LIVE_SESSION: &str = "antidote.dev/live-session";

/// Label key carrying the lesson slug
pub const LABEL_LESSON: &str = "antidote.dev/lesson";

/// Label key carrying the creation time as unix seconds
pub const LABEL_CREATED: &str = "antidote.dev/created";

/// Label key carrying the last-refresh time as unix seconds
pub const LABEL_LAST_ACCESSED: &str = "antidote.dev/last-accessed";

/// Label key naming the endpoint a pod or service belongs to
pub const LABEL_ENDPOINT: &str = "antidote.dev/endpoint";

/// Label key classifying batch jobs (see [`JOB_TYPE_CONFIG`])
pub const LABEL_JOB_TYPE: &str = "antidote.dev/job-type";

/// Job type value for endpoint configuration jobs
pub const JOB_TYPE_CONFIG: &str = "config";

/// Label placed on configuration job pods; exempts them from egress isolation
pub const LABEL_CONFIG_POD: &str = "antidote.dev/config-pod";

/// Subject on which lifecycle requests arrive
pub const SUBJECT_REQUESTS: &str = "antidote.lsr.incoming";

/// Subject on which completed requests are announced
pub const SUBJECT_COMPLETED: &str = "antidote.lsr.completed";
