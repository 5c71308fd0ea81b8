//! Error types for Lattice federation
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant maps onto one [`ErrorKind`], the taxonomy callers branch on when
//! deciding whether to retry, report a conflict, or surface a precondition.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Failure classes exposed to callers of federation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Template, cluster, or join record does not exist (also "not attached")
    NotFound,
    /// Duplicate attach attempt or concurrent modification
    Conflict,
    /// Deletion refused because dependents still exist
    NotEmpty,
    /// A dependent resource is not provisioned yet (e.g. cluster namespace)
    Precondition,
    /// Template-to-object conversion or input failed validation
    ValidationFailed,
    /// Cluster unreachable or returned a transport-level error; safe to retry
    TransientIo,
    /// Invariant violation (lock failure, persistence corruption)
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::Conflict => "Conflict",
            Self::NotEmpty => "NotEmpty",
            Self::Precondition => "Precondition",
            Self::ValidationFailed => "ValidationFailed",
            Self::TransientIo => "TransientIO",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// Main error type for Lattice federation operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Object does not exist
    #[error("{resource} {name} not found")]
    NotFound {
        /// Resource keyword (e.g. "cluster", "federatedclusterrole")
        resource: String,
        /// Id or name that was looked up
        name: String,
    },

    /// Object already exists or was modified concurrently
    #[error("conflict on {resource} {name}: {message}")]
    Conflict {
        /// Resource keyword
        resource: String,
        /// Id or name of the conflicting object
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// Deletion refused while dependents exist
    #[error("{resource} {name} is not empty: {message}")]
    NotEmpty {
        /// Resource keyword
        resource: String,
        /// Id or name of the object being deleted
        name: String,
        /// Which dependents are still present
        message: String,
    },

    /// A dependent object is not ready yet
    #[error("precondition failed for {resource} {name}: {message}")]
    Precondition {
        /// Resource keyword
        resource: String,
        /// Id or name of the object that cannot proceed
        name: String,
        /// What is missing
        message: String,
    },

    /// Validation error for templates and inputs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource keyword or name with invalid content
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.template.roleRef")
        field: Option<String>,
    },

    /// Transport-level failure talking to a cluster
    #[error("transient I/O error [{target}]: {message}")]
    TransientIo {
        /// Cluster or endpoint that failed
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "lock", "store")
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        resource: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            resource: resource.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a not-empty error (delete guard)
    pub fn not_empty(
        resource: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::NotEmpty {
            resource: resource.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a precondition error
    pub fn precondition(
        resource: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Precondition {
            resource: resource.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transient I/O error against a cluster or endpoint
    pub fn transient(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TransientIo {
            target: target.into(),
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

    /// Create a serialization error with resource kind context
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

    /// Classify this error into the federation taxonomy
    ///
    /// Kubernetes API errors are mapped by status code: 404 is NotFound,
    /// 409 is Conflict, 400/422 are validation failures. Everything else
    /// coming out of kube (5xx, connection resets, TLS) is transient.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 404 => ErrorKind::NotFound,
                kube::Error::Api(ae) if ae.code == 409 => ErrorKind::Conflict,
                kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
                    ErrorKind::ValidationFailed
                }
                _ => ErrorKind::TransientIo,
            },
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::NotEmpty { .. } => ErrorKind::NotEmpty,
            Error::Precondition { .. } => ErrorKind::Precondition,
            Error::Validation { .. } => ErrorKind::ValidationFailed,
            Error::TransientIo { .. } => ErrorKind::TransientIo,
            Error::Serialization { .. } => ErrorKind::ValidationFailed,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transport-class failures are safe to retry without changing input.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::TransientIo { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
