//! Background task dispatch with completion signals
//!
//! Sync, update and namespaced-attach flows run as tasks. Callers that do
//! not care drop the [`TaskHandle`]; callers that do await it with a timeout.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, Instrument};

use lattice_common::Error;

use crate::Result;

/// What a task does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Reconcile a template on every attached cluster
    Sync,
    /// Sync after a template update
    Update,
    /// Ensure the namespace, then attach a namespaced template
    NamespacedAttach,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sync => "sync",
            Self::Update => "update",
            Self::NamespacedAttach => "namespaced-attach",
        };
        f.write_str(s)
    }
}

/// Completion signal of a scheduled task
#[derive(Debug)]
pub struct TaskHandle {
    kind: TaskKind,
    target: String,
    done: oneshot::Receiver<Result<()>>,
}

impl TaskHandle {
    /// Handle wired to `done`
    pub fn new(kind: TaskKind, target: impl Into<String>, done: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            kind,
            target: target.into(),
            done,
        }
    }

    /// Task kind
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Object the task works on
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait for the task result
    ///
    /// Timing out does not cancel the task. A task that vanished without
    /// reporting (panic) is an `Internal` error.
    pub async fn wait(self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::internal_with_context(
                "task",
                format!("{} task for {} ended without a result", self.kind, self.target),
            )
            .into()),
            Err(_) => Err(Error::internal_with_context(
                "task",
                format!(
                    "{} task for {} still running after {:?}",
                    self.kind, self.target, timeout
                ),
            )
            .into()),
        }
    }
}

/// Asynchronous task capability
pub trait TaskDispatcher: Send + Sync {
    /// Run `task` in the background
    fn schedule(&self, kind: TaskKind, target: String, task: BoxFuture<'static, Result<()>>)
        -> TaskHandle;
}

/// Runs tasks on the tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskDispatcher;

impl TaskDispatcher for TokioTaskDispatcher {
    fn schedule(
        &self,
        kind: TaskKind,
        target: String,
        task: BoxFuture<'static, Result<()>>,
    ) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        let span = info_span!("federation_task", task = %kind, target = %target);
        let log_target = target.clone();
        tokio::spawn(
            async move {
                let result = task.await;
                match &result {
                    Ok(()) => debug!("task finished"),
                    Err(e) => error!(error = %e, target = %log_target, "task failed"),
                }
                // The caller may have dropped the handle.
                let _ = tx.send(result);
            }
            .instrument(span),
        );
        TaskHandle::new(kind, target, rx)
    }
}
