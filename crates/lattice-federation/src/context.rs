//! Shared capabilities handed to every reconciliation engine
//!
//! One [`FederationContext`] is built at process start and shared by the
//! engines of all kinds. Production wiring uses [`FederationContext::builder`];
//! tests swap individual capabilities for fakes or mocks.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use lattice_common::audit::{AuditEvent, AuditSink, TracingAuditSink};
use lattice_common::FederationConfig;

use crate::cluster_client::{ClusterClient, KubeClusterClient, KubeconfigConnector};
use crate::cluster_directory::ClusterDirectory;
use crate::fanout::FanoutAggregator;
use crate::lock::{KeyedLockManager, LockManager};
use crate::model::{Cluster, FederatedKind};
use crate::tasks::{TaskDispatcher, TokioTaskDispatcher};
use crate::Result;

/// Runs once on a newly created remote resource, under its resource lock
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PostCreateHook: Send + Sync {
    /// Called after `resource` was created in `cluster`
    async fn on_created(
        &self,
        kind: FederatedKind,
        cluster: &Cluster,
        resource: &DynamicObject,
    ) -> Result<()>;
}

/// Hook that does nothing
pub struct NoopPostCreate;

#[async_trait]
impl PostCreateHook for NoopPostCreate {
    async fn on_created(
        &self,
        kind: FederatedKind,
        cluster: &Cluster,
        resource: &DynamicObject,
    ) -> Result<()> {
        debug!(
            kind = %kind,
            cluster = %cluster.name,
            resource = resource.metadata.name.as_deref().unwrap_or(""),
            "resource created"
        );
        Ok(())
    }
}

/// Capabilities shared by all engines
pub struct FederationContext {
    /// Member cluster lookup
    pub clusters: Arc<dyn ClusterDirectory>,
    /// Remote resource access
    pub client: Arc<dyn ClusterClient>,
    /// Object-scoped locks
    pub locks: Arc<dyn LockManager>,
    /// Audit trail
    pub audit: Arc<dyn AuditSink>,
    /// Background tasks
    pub tasks: Arc<dyn TaskDispatcher>,
    /// Post-create hook
    pub post_create: Arc<dyn PostCreateHook>,
    /// Runtime settings
    pub config: FederationConfig,
}

impl FederationContext {
    /// Create a builder; `clusters` is the only capability without a default
    pub fn builder(clusters: Arc<dyn ClusterDirectory>) -> ContextBuilder {
        ContextBuilder::new(clusters)
    }

    /// Record an audit event; never fails
    pub async fn audit(&self, event: AuditEvent) {
        self.audit.log_event(&event).await;
    }

    /// Fan-out aggregator over this context's clusters and client
    pub fn fanout(&self) -> FanoutAggregator {
        FanoutAggregator::new(self.clusters.clone(), self.client.clone())
    }
}

/// Builder for [`FederationContext`]
///
/// ```text
/// let ctx = FederationContext::builder(clusters)
///     .config(FederationConfig::from_os_env()?)
///     .audit_sink(Arc::new(KubeEventAuditSink::new(client, FEDERATION_CONTROLLER_NAME, LATTICE_SYSTEM_NAMESPACE)))
///     .build();
/// ```
pub struct ContextBuilder {
    clusters: Arc<dyn ClusterDirectory>,
    client: Option<Arc<dyn ClusterClient>>,
    locks: Option<Arc<dyn LockManager>>,
    audit: Option<Arc<dyn AuditSink>>,
    tasks: Option<Arc<dyn TaskDispatcher>>,
    post_create: Option<Arc<dyn PostCreateHook>>,
    config: FederationConfig,
}

impl ContextBuilder {
    fn new(clusters: Arc<dyn ClusterDirectory>) -> Self {
        Self {
            clusters,
            client: None,
            locks: None,
            audit: None,
            tasks: None,
            post_create: None,
            config: FederationConfig::default(),
        }
    }

    /// Runtime settings (defaults otherwise)
    pub fn config(mut self, config: FederationConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the cluster client (defaults to [`KubeClusterClient`])
    pub fn cluster_client(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the lock manager
    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Override the audit sink (defaults to [`TracingAuditSink`])
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Override the task dispatcher
    pub fn task_dispatcher(mut self, tasks: Arc<dyn TaskDispatcher>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Run `hook` on every newly created remote resource
    pub fn post_create_hook(mut self, hook: Arc<dyn PostCreateHook>) -> Self {
        self.post_create = Some(hook);
        self
    }

    /// Build the context
    pub fn build(self) -> FederationContext {
        let field_manager = self.config.field_manager.clone();
        let lock_timeout = self.config.lock_timeout;
        FederationContext {
            clusters: self.clusters,
            client: self.client.unwrap_or_else(|| {
                Arc::new(KubeClusterClient::new(
                    Arc::new(KubeconfigConnector::default()),
                    field_manager,
                ))
            }),
            locks: self
                .locks
                .unwrap_or_else(|| Arc::new(KeyedLockManager::new(lock_timeout))),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            tasks: self.tasks.unwrap_or_else(|| Arc::new(TokioTaskDispatcher)),
            post_create: self.post_create.unwrap_or_else(|| Arc::new(NoopPostCreate)),
            config: self.config,
        }
    }
}
