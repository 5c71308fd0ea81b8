//! Audit trail for federation operations.
//!
//! Every attach, detach, sync, update and delete records one [`AuditEvent`]
//! through an [`AuditSink`]. Sinks are **fire-and-forget**: failures are
//! logged as warnings and never propagate. A failed audit write must never
//! break reconciliation.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::{info, warn};

/// Operation being audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    /// Template attached to a cluster
    Attach,
    /// Template detached from a cluster
    Detach,
    /// Template re-synced across attached clusters
    Sync,
    /// Template spec updated
    Update,
    /// Template deleted
    Delete,
}

impl AuditAction {
    /// PascalCase string used as the Kubernetes event action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attach => "Attach",
            Self::Detach => "Detach",
            Self::Sync => "Sync",
            Self::Update => "Update",
            Self::Delete => "Delete",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object an audit event is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditObject {
    /// Federated kind keyword (e.g. "federatedclusterrole")
    pub kind: String,
    /// Template id
    pub id: String,
    /// Template name
    pub name: String,
    /// Target cluster, when the operation is cluster-specific
    pub cluster: Option<String>,
}

impl AuditObject {
    /// Audit object for a template-wide operation
    pub fn template(
        kind: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            name: name.into(),
            cluster: None,
        }
    }

    /// Scope this object to a specific cluster
    pub fn on_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }
}

/// Result of the audited operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Operation completed
    Success,
    /// Operation failed with the given message
    Failure(String),
}

impl Outcome {
    /// Build an outcome from any result, keeping only the error text
    pub fn of<T, E: fmt::Display>(result: &std::result::Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => Self::Failure(e.to_string()),
        }
    }

    /// True for [`Outcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// What was done
    pub action: AuditAction,
    /// What it was done to
    pub object: AuditObject,
    /// How it ended
    pub outcome: Outcome,
    /// Optional human-readable detail
    pub note: Option<String>,
}

impl AuditEvent {
    /// Successful event with no note
    pub fn success(action: AuditAction, object: AuditObject) -> Self {
        Self {
            action,
            object,
            outcome: Outcome::Success,
            note: None,
        }
    }

    /// Attach a note to the event
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Trait for recording audit events.
///
/// Implementations are expected to be fire-and-forget: `log_event()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one audit event
    async fn log_event(&self, event: &AuditEvent);
}

/// Writes audit events as structured `tracing` records.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_event(&self, event: &AuditEvent) {
        let cluster = event.object.cluster.as_deref().unwrap_or("-");
        match &event.outcome {
            Outcome::Success => info!(
                action = %event.action,
                kind = %event.object.kind,
                template = %event.object.id,
                name = %event.object.name,
                cluster,
                note = event.note.as_deref().unwrap_or(""),
                "audit"
            ),
            Outcome::Failure(error) => warn!(
                action = %event.action,
                kind = %event.object.kind,
                template = %event.object.id,
                name = %event.object.name,
                cluster,
                error = %error,
                "audit"
            ),
        }
    }
}

/// Publishes audit events as Kubernetes Events on the management cluster.
pub struct KubeEventAuditSink {
    recorder: Recorder,
    namespace: String,
}

impl KubeEventAuditSink {
    /// Create a sink for the given controller name.
    ///
    /// Events are attached to an object reference named after the template in
    /// `namespace`, so `kubectl get events -n <namespace>` shows the trail.
    pub fn new(client: Client, controller_name: &str, namespace: impl Into<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
            namespace: namespace.into(),
        }
    }

    fn reference_for(&self, object: &AuditObject) -> ObjectReference {
        ObjectReference {
            kind: Some(object.kind.clone()),
            name: Some(object.name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: Some(object.id.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AuditSink for KubeEventAuditSink {
    async fn log_event(&self, event: &AuditEvent) {
        let (type_, reason) = match &event.outcome {
            Outcome::Success => (EventType::Normal, format!("{}Succeeded", event.action)),
            Outcome::Failure(_) => (EventType::Warning, format!("{}Failed", event.action)),
        };
        let note = match (&event.outcome, &event.object.cluster) {
            (Outcome::Failure(e), Some(c)) => Some(format!("cluster {}: {}", c, e)),
            (Outcome::Failure(e), None) => Some(e.clone()),
            (Outcome::Success, Some(c)) => Some(
                event
                    .note
                    .clone()
                    .unwrap_or_else(|| format!("cluster {}", c)),
            ),
            (Outcome::Success, None) => event.note.clone(),
        };
        let kube_event = Event {
            type_,
            reason: reason.clone(),
            note,
            action: event.action.as_str().to_string(),
            secondary: None,
        };
        let reference = self.reference_for(&event.object);
        if let Err(e) = self.recorder.publish(&kube_event, &reference).await {
            warn!(
                reason = %reason,
                action = %event.action,
                error = %e,
                "Failed to publish audit event"
            );
        }
    }
}

/// No-op sink. All calls are silently ignored.
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn log_event(&self, _event: &AuditEvent) {}
}

/// Keeps every event in memory, for assertions in tests.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Recorded actions in order
    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn log_event(&self, event: &AuditEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
