//! Error types for keel cluster orchestration
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information like cluster names,
//! provider identities, and the operation that failed.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input caught before any provider call is made
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nodePools.np1.instanceType")
        field: Option<String>,
    },

    /// A provider driver's cloud API rejected or failed a call
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Name of the cluster being operated on
        cluster: String,
        /// Provider variant (alibaba, ec2, ec2-pke, gke, eks)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A bounded wait exceeded its maximum elapsed time
    #[error("timed out after {elapsed:?} waiting for {operation} on {cluster}")]
    Timeout {
        /// Name of the cluster being waited on
        cluster: String,
        /// What was being awaited
        operation: String,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// A cluster, node pool, secret or catalog entry does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of the missing object (cluster, node pool, secret, ...)
        kind: String,
        /// Identifier of the missing object
        name: String,
    },

    /// The request conflicts with the current state of the record
    #[error("conflict for {cluster}: {message}")]
    Conflict {
        /// Name of the cluster in conflict
        cluster: String,
        /// Description of the conflict
        message: String,
    },

    /// The operation has no meaning for this provider variant
    #[error("{operation} is not applicable to provider {provider}")]
    NotApplicable {
        /// Provider variant
        provider: String,
        /// Operation that was requested
        operation: String,
    },

    /// The provider variant does not implement this operation
    #[error("{operation} is not implemented for provider {provider}")]
    NotImplemented {
        /// Provider variant
        provider: String,
        /// Operation that was requested
        operation: String,
    },

    /// Storage layer failure, surfaced verbatim
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error from an in-cluster client
    #[error("kubernetes error: {message}")]
    Kube {
        /// Description of what failed
        message: String,
        /// HTTP status code returned by the API server, if any
        code: Option<u16>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "orchestrator", "registry")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        msg: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (invalid input, quota, rejected state)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a timeout error for a bounded wait
    pub fn timeout(
        cluster: impl Into<String>,
        operation: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self::Timeout {
            cluster: cluster.into(),
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error with cluster context
    pub fn conflict(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a "not applicable" error for a provider operation
    pub fn not_applicable(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotApplicable {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    /// Create a "not implemented" error for a provider operation
    pub fn not_implemented(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    /// Create a persistence error with the given message
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
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

    /// Check if this error is retryable
    ///
    /// Input and state errors are not retryable (require a fix or a different
    /// request). Timeouts, storage and internal errors may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => false,
            Error::NotApplicable { .. } => false,
            Error::NotImplemented { .. } => false,
            Error::Persistence { .. } => true,
            Error::Kube { code, .. } => !matches!(code, Some(c) if (400..500).contains(c)),
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provider { cluster, .. } => Some(cluster),
            Error::Timeout { cluster, .. } => Some(cluster),
            Error::Conflict { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// True for the distinguished "operation not applicable" error
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, Error::NotApplicable { .. })
    }

    /// True for not-found errors
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for poller timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
