//! Error types for the Antidote scheduler
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the lab, endpoint, or operation it relates to so a
//! single log line is enough to see where a workflow stalled.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Antidote operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource or record does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of object (e.g. "Namespace", "LiveLesson")
        kind: String,
        /// Name or ID of the object
        name: String,
    },

    /// A resource already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of object
        kind: String,
        /// Name of the object
        name: String,
    },

    /// A bounded wait exceeded its ceiling
    #[error("timed out during {operation}: {message}")]
    Timeout {
        /// The wait that expired (e.g. "pod readiness")
        operation: String,
        /// Description of what was being waited on
        message: String,
        /// Logs captured from the failing unit, if any
        diagnostics: Option<String>,
    },

    /// One or more endpoints never became reachable
    #[error("live lesson {live_lesson} unreachable: endpoints {endpoints:?}")]
    Unreachable {
        /// LiveLesson ID
        live_lesson: String,
        /// Endpoints whose tests never all passed
        endpoints: Vec<String>,
    },

    /// A configuration job for an endpoint failed
    #[error("configuration of {endpoint} failed: {message}")]
    Configuration {
        /// Endpoint being configured
        endpoint: String,
        /// Description of what failed
        message: String,
        /// Logs from the last failed attempt
        logs: Option<String>,
    },

    /// Input failed validation
    #[error("validation error [{context}]: {message}")]
    Validation {
        /// Where validation failed (lesson slug, request ID, ...)
        context: String,
        /// Description of what's invalid
        message: String,
    },

    /// Persisted-state error from the data store
    #[error("data store error: {message}")]
    DataStore {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Message transport error
    #[error("transport error: {message}")]
    Transport {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a timeout error without diagnostics
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
            diagnostics: None,
        }
    }

    /// Create a timeout error carrying captured logs
    pub fn timeout_with_diagnostics(
        operation: impl Into<String>,
        msg: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
            diagnostics: Some(diagnostics.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration(
        endpoint: impl Into<String>,
        msg: impl Into<String>,
        logs: Option<String>,
    ) -> Self {
        Self::Configuration {
            endpoint: endpoint.into(),
            message: msg.into(),
            logs,
        }
    }

    /// Create a validation error without specific context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with context
    pub fn validation_for(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a data store error
    pub fn data_store(msg: impl Into<String>) -> Self {
        Self::DataStore {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if the error means "the object is already gone"
    ///
    /// Recognises both the explicit variant and a raw 404 from the API server.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True if a create call collided with an existing object
    ///
    /// Recognises both the explicit variant and a raw 409 from the API server.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Captured diagnostic logs, if the error carries any
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Error::Timeout { diagnostics, .. } => diagnostics.as_deref(),
            Error::Configuration { logs, .. } => logs.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
