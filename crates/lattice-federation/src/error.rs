//! Federation-specific error types

use std::fmt;

use lattice_common::ErrorKind;

use crate::model::{FederatedKind, JoinRecord};

/// Which operation failed and on what, attached to collaborator errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    /// Operation name (e.g. "attach", "reconcile")
    pub operation: &'static str,
    /// Template kind
    pub kind: FederatedKind,
    /// Template id
    pub template_id: String,
    /// Target cluster, if any
    pub cluster_id: Option<String>,
    /// Join record, if any
    pub join_id: Option<String>,
}

impl OperationContext {
    /// Context for a template-wide operation
    pub fn new(operation: &'static str, kind: FederatedKind, template_id: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            template_id: template_id.into(),
            cluster_id: None,
            join_id: None,
        }
    }

    /// Context for an operation on one join record
    pub fn for_record(operation: &'static str, record: &JoinRecord) -> Self {
        Self {
            operation,
            kind: record.kind,
            template_id: record.federated_template_id.clone(),
            cluster_id: Some(record.cluster_id.clone()),
            join_id: Some(record.id.clone()),
        }
    }

    /// Add the target cluster
    pub fn cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.operation, self.kind, self.template_id)?;
        if let Some(cluster) = &self.cluster_id {
            write!(f, " cluster={}", cluster)?;
        }
        if let Some(join) = &self.join_id {
            write!(f, " join={}", join)?;
        }
        Ok(())
    }
}

/// Errors returned by federation operations
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("{0}")]
    Common(#[from] lattice_common::Error),

    #[error("{context}: {source}")]
    Context {
        context: OperationContext,
        source: Box<FederationError>,
    },

    /// The join record was persisted but the first reconcile failed. The
    /// record stays attached and unprovisioned; retry with a sync.
    #[error("attached {} to cluster {} but sync failed: {source}", record.federated_template_id, record.cluster_id)]
    AttachedNotSynced {
        record: Box<JoinRecord>,
        source: Box<FederationError>,
    },

    /// The join record was removed but the remote resource could not be deleted.
    #[error("detached {} from cluster {} but remote cleanup failed: {source}", record.federated_template_id, record.cluster_id)]
    DetachedNotCleaned {
        record: Box<JoinRecord>,
        source: Box<FederationError>,
    },

    #[error("sync of {kind} {template_id} failed on {} cluster(s): {}", failures.len(), summarize(failures))]
    SyncFailed {
        kind: FederatedKind,
        template_id: String,
        failures: Vec<(String, FederationError)>,
    },
}

fn summarize(failures: &[(String, FederationError)]) -> String {
    failures
        .iter()
        .map(|(cluster, e)| format!("{}: {}", cluster, e))
        .collect::<Vec<_>>()
        .join("; ")
}

impl FederationError {
    /// Taxonomy class; wrapping never changes it
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Common(e) => e.kind(),
            Self::Context { source, .. }
            | Self::AttachedNotSynced { source, .. }
            | Self::DetachedNotCleaned { source, .. } => source.kind(),
            Self::SyncFailed { failures, .. } => failures
                .first()
                .map(|(_, e)| e.kind())
                .unwrap_or(ErrorKind::Internal),
        }
    }

    /// Safe to retry without changing input
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }

    /// The join record that was persisted despite the failure, if any
    pub fn persisted_record(&self) -> Option<&JoinRecord> {
        match self {
            Self::AttachedNotSynced { record, .. } => Some(record),
            Self::Context { source, .. } => source.persisted_record(),
            _ => None,
        }
    }

    /// Operation context of the outermost wrapper
    pub fn context(&self) -> Option<&OperationContext> {
        match self {
            Self::Context { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<kube::Error> for FederationError {
    fn from(e: kube::Error) -> Self {
        Self::Common(e.into())
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Common(e.into())
    }
}

/// Attach operation context to any fallible result
pub trait ResultExt<T> {
    /// Wrap the error with `context`
    fn with_context(self, context: impl FnOnce() -> OperationContext) -> Result<T, FederationError>;
}

impl<T, E: Into<FederationError>> ResultExt<T> for Result<T, E> {
    fn with_context(self, context: impl FnOnce() -> OperationContext) -> Result<T, FederationError> {
        self.map_err(|e| {
            let source = e.into();
            match source {
                // Keep partial-success errors at the top so callers can see the record.
                FederationError::AttachedNotSynced { .. }
                | FederationError::DetachedNotCleaned { .. } => source,
                other => FederationError::Context {
                    context: context(),
                    source: Box::new(other),
                },
            }
        })
    }
}
