//! Reconciliation engine
//!
//! One [`ReconciliationEngine`] per federated kind. It owns the join records
//! of that kind and converges each (template, cluster) pair onto a projected
//! resource in the member cluster.
//!
//! Reconcile is an idempotent upsert keyed by (name, cluster, namespace) with
//! the join record's resource id as a fast path, so it can be re-run after a
//! failed attach, a template update, or a manual sync.

use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use kube::api::DynamicObject;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use lattice_common::audit::{AuditAction, AuditEvent, AuditObject, Outcome};
use lattice_common::{DetachPolicy, Error, ErrorKind};

use crate::cluster_client::{from_dynamic, resource_uid, to_dynamic, ResourceLookup, ResourceTarget};
use crate::context::FederationContext;
use crate::error::{FederationError, OperationContext, ResultExt};
use crate::kinds::{Placement, ResourceProjector};
use crate::lock::{reconcile_key, resource_key, template_key};
use crate::model::{
    Cluster, ClusterRef, FederatedKind, FederatedTemplate, JoinRecord, ResourceScope,
    TemplateStatus,
};
use crate::namespace::{DeleteGuard, NamespaceResolver, ResolvedNamespace};
use crate::store::{JoinRecordStore, TemplateStore};
use crate::tasks::{TaskHandle, TaskKind};
use crate::Result;

/// Whether a join record has a live remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindStatus {
    /// Attached but never provisioned
    NotBind,
    /// Remote resource exists
    Bound,
    /// Provisioned once, but the remote resource is gone
    Missing,
}

/// What a join record points at, resolved for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDetails {
    pub join_id: String,
    pub keyword: &'static str,
    pub template_id: String,
    pub template_name: String,
    pub cluster_id: String,
    pub cluster_name: String,
    /// Cluster namespace for namespaced kinds, when it can be resolved
    pub namespace: Option<String>,
    pub resource_id: Option<String>,
    pub status: BindStatus,
}

/// Engine for one federated kind
pub struct ReconciliationEngine<P: ResourceProjector> {
    ctx: Arc<FederationContext>,
    projector: P,
    templates: Arc<dyn TemplateStore<P::Spec>>,
    joins: Arc<dyn JoinRecordStore>,
    namespaces: Option<NamespaceResolver>,
    delete_guard: Option<Arc<dyn DeleteGuard>>,
}

impl<P: ResourceProjector> ReconciliationEngine<P> {
    /// Engine over the given stores
    pub fn new(
        ctx: Arc<FederationContext>,
        projector: P,
        templates: Arc<dyn TemplateStore<P::Spec>>,
        joins: Arc<dyn JoinRecordStore>,
    ) -> Self {
        Self {
            ctx,
            projector,
            templates,
            joins,
            namespaces: None,
            delete_guard: None,
        }
    }

    /// Resolve cluster namespaces through `resolver` (required for namespaced kinds)
    pub fn with_namespaces(mut self, resolver: NamespaceResolver) -> Self {
        self.namespaces = Some(resolver);
        self
    }

    /// Extra check run before a template is deleted
    pub fn with_delete_guard(mut self, guard: Arc<dyn DeleteGuard>) -> Self {
        self.delete_guard = Some(guard);
        self
    }

    /// Kind handled by this engine
    pub fn kind(&self) -> FederatedKind {
        P::KIND
    }

    /// Shared capabilities
    pub fn context(&self) -> &Arc<FederationContext> {
        &self.ctx
    }

    /// Join records of this kind
    pub fn joins(&self) -> &Arc<dyn JoinRecordStore> {
        &self.joins
    }

    /// Template by id
    pub async fn template(&self, template_id: &str) -> Result<FederatedTemplate<P::Spec>> {
        self.templates.get(template_id).await
    }

    fn audit_object(&self, template: &FederatedTemplate<P::Spec>) -> AuditObject {
        AuditObject::template(P::KIND.keyword(), template.id(), template.name())
    }

    async fn audit<T>(
        &self,
        action: AuditAction,
        object: AuditObject,
        result: &Result<T>,
        note: Option<String>,
    ) {
        self.ctx
            .audit(AuditEvent {
                action,
                object,
                outcome: Outcome::of(result),
                note,
            })
            .await;
    }

    fn resolver(&self) -> Result<&NamespaceResolver> {
        self.namespaces.as_ref().ok_or_else(|| {
            Error::internal_with_context(P::KIND.keyword(), "no namespace resolver configured")
                .into()
        })
    }

    fn federated_namespace_id<'t>(&self, template: &'t FederatedTemplate<P::Spec>) -> Result<&'t str> {
        template
            .meta
            .federated_namespace_id
            .as_deref()
            .ok_or_else(|| {
                Error::validation_for_field(
                    P::KIND.keyword(),
                    "federatedNamespaceId",
                    format!("{} must be placed in a federated namespace", template.name()),
                )
                .into()
            })
    }

    /// Validate and store a new template; it starts `Active`
    #[instrument(skip(self, template), fields(kind = %P::KIND, name = %template.meta.name))]
    pub async fn create_template(
        &self,
        mut template: FederatedTemplate<P::Spec>,
    ) -> Result<FederatedTemplate<P::Spec>> {
        self.projector.validate_create(&template).await?;
        match P::KIND.scope() {
            ResourceScope::Namespaced => {
                let namespace_id = self.federated_namespace_id(&template)?;
                self.resolver()?.template(namespace_id).await?;
            }
            ResourceScope::Cluster => {
                if template.meta.federated_namespace_id.is_some() {
                    return Err(Error::validation_for_field(
                        P::KIND.keyword(),
                        "federatedNamespaceId",
                        "cluster-scoped templates cannot be placed in a namespace",
                    )
                    .into());
                }
            }
        }
        template.meta.status = TemplateStatus::Active;
        let created = self.templates.create(template).await?;
        info!(template = %created.id(), "template created");
        Ok(created)
    }

    /// Attach a template to a cluster and provision it there
    ///
    /// The join record is created under the template lock; the first
    /// reconcile runs after the lock is released. If that reconcile fails the
    /// record stays in place and the error is
    /// [`FederationError::AttachedNotSynced`].
    #[instrument(skip(self), fields(kind = %P::KIND))]
    pub async fn attach(&self, template_id: &str, cluster: &ClusterRef) -> Result<JoinRecord> {
        self.templates.get(template_id).await?;
        let cluster = self
            .ctx
            .clusters
            .resolve(cluster)
            .await
            .with_context(|| OperationContext::new("attach", P::KIND, template_id))?;

        let (template, record) = {
            let _lock = self
                .ctx
                .locks
                .lock_object(&template_key(P::KIND, template_id))
                .await?;
            // Deleted while waiting for the lock.
            let template = self.templates.get(template_id).await?;
            if self.joins.lookup(template_id, &cluster.id).await?.is_some() {
                return Err(Error::conflict(
                    P::KIND.keyword(),
                    template.name(),
                    format!("already attached to cluster {}", cluster.name),
                )
                .into());
            }
            let record = self
                .joins
                .insert(JoinRecord::new(P::KIND, template_id, cluster.id.clone()))
                .await?;
            (template, record)
        };
        debug!(join = %record.id, cluster = %cluster.name, "join record created");
        self.audit(
            AuditAction::Attach,
            self.audit_object(&template).on_cluster(cluster.name.clone()),
            &Ok::<(), FederationError>(()),
            None,
        )
        .await;

        let result = self.reconcile_on(&template, &cluster, record.clone()).await;
        let note = result.is_err().then(|| "join record persisted".to_string());
        self.audit(
            AuditAction::Sync,
            self.audit_object(&template).on_cluster(cluster.name.clone()),
            &result,
            note,
        )
        .await;

        result.map_err(|source| FederationError::AttachedNotSynced {
            record: Box::new(record),
            source: Box::new(source),
        })
    }

    /// Remove the join record of a (template, cluster) pair
    ///
    /// With [`DetachPolicy::Delete`] the provisioned resource is deleted
    /// afterwards, outside the template lock.
    #[instrument(skip(self), fields(kind = %P::KIND))]
    pub async fn detach(&self, template_id: &str, cluster: &ClusterRef) -> Result<()> {
        let template = self.templates.get(template_id).await?;
        let cluster = self
            .ctx
            .clusters
            .resolve(cluster)
            .await
            .with_context(|| OperationContext::new("detach", P::KIND, template_id))?;

        let record = {
            let _lock = self
                .ctx
                .locks
                .lock_object(&template_key(P::KIND, template_id))
                .await?;
            let record = self
                .joins
                .lookup(template_id, &cluster.id)
                .await?
                .ok_or_else(|| {
                    Error::not_found(
                        P::KIND.keyword(),
                        format!("{} (not attached to cluster {})", template.name(), cluster.name),
                    )
                })?;
            self.joins.delete(&record).await?;
            record
        };

        let policy = self.ctx.config.detach_policy;
        let cleanup = match policy {
            DetachPolicy::Delete => self
                .delete_remote(&cluster, &record)
                .await
                .with_context(|| OperationContext::for_record("detach", &record)),
            DetachPolicy::Orphan => Ok(()),
        };
        self.audit(
            AuditAction::Detach,
            self.audit_object(&template).on_cluster(cluster.name.clone()),
            &cleanup,
            Some(format!("policy {:?}", policy).to_lowercase()),
        )
        .await;

        cleanup.map_err(|source| FederationError::DetachedNotCleaned {
            record: Box::new(record),
            source: Box::new(source),
        })
    }

    async fn delete_remote(&self, cluster: &Cluster, record: &JoinRecord) -> Result<()> {
        let Some(uid) = &record.resource_id else {
            return Ok(());
        };
        // Namespace unknown here: search every namespace by uid.
        let search = ResourceTarget {
            kind: P::KIND,
            namespace: None,
        };
        let Some(object) = self
            .ctx
            .client
            .fetch(cluster, &search, &ResourceLookup::Id(uid.clone()))
            .await?
        else {
            debug!(resource = %uid, "remote resource already gone");
            return Ok(());
        };
        let name = object.metadata.name.clone().unwrap_or_default();
        let target = ResourceTarget {
            kind: P::KIND,
            namespace: object.metadata.namespace.clone(),
        };
        self.ctx.client.delete(cluster, &target, &name).await?;
        info!(resource = %name, cluster = %cluster.name, "deleted detached resource");
        Ok(())
    }

    /// Re-run reconcile for an attached (template, cluster) pair
    pub async fn sync_cluster(&self, template_id: &str, cluster: &ClusterRef) -> Result<JoinRecord> {
        let cluster = self.ctx.clusters.resolve(cluster).await?;
        let record = self
            .joins
            .lookup(template_id, &cluster.id)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    P::KIND.keyword(),
                    format!("{} (not attached to cluster {})", template_id, cluster.name),
                )
            })?;
        let template = self.templates.get(template_id).await?;
        self.reconcile_on(&template, &cluster, record).await
    }

    /// Converge the remote resource of `record` onto its template
    ///
    /// Returns the record as persisted afterwards.
    pub async fn reconcile_resource(&self, record: &JoinRecord) -> Result<JoinRecord> {
        let context = || OperationContext::for_record("reconcile", record);
        let template = self
            .templates
            .get(&record.federated_template_id)
            .await
            .with_context(context)?;
        let cluster = self
            .ctx
            .clusters
            .resolve(&ClusterRef::id(record.cluster_id.clone()))
            .await
            .with_context(context)?;
        self.reconcile_on(&template, &cluster, record.clone()).await
    }

    async fn reconcile_on(
        &self,
        template: &FederatedTemplate<P::Spec>,
        cluster: &Cluster,
        record: JoinRecord,
    ) -> Result<JoinRecord> {
        let context = OperationContext::for_record("reconcile", &record);
        self.reconcile_inner(template, cluster, record)
            .await
            .with_context(|| context)
    }

    #[instrument(skip_all, fields(kind = %P::KIND, template = %record.federated_template_id, cluster = %cluster.name))]
    async fn reconcile_inner(
        &self,
        template: &FederatedTemplate<P::Spec>,
        cluster: &Cluster,
        mut record: JoinRecord,
    ) -> Result<JoinRecord> {
        let _lock = self
            .ctx
            .locks
            .lock_object(&reconcile_key(P::KIND, &record.federated_template_id, &record.cluster_id))
            .await?;

        let namespace = match P::KIND.scope() {
            ResourceScope::Cluster => None,
            ResourceScope::Namespaced => {
                let namespace_id = self.federated_namespace_id(template)?;
                Some(self.resolver()?.resolve(namespace_id, cluster).await?)
            }
        };
        let target = match &namespace {
            Some(ns) => ResourceTarget::namespaced(P::KIND, ns.name.clone()),
            None => ResourceTarget::cluster_scoped(P::KIND),
        };

        match self.find_existing(template, cluster, &target, &record).await? {
            Some(existing) => {
                let current: P::Resource = from_dynamic(existing)?;
                let desired = self.projector.build_update(template, current)?;
                let updated = self
                    .ctx
                    .client
                    .update(cluster, &target, to_dynamic(&desired)?)
                    .await?;
                let uid = resource_uid(&updated)?;
                if record.resource_id.as_deref() != Some(uid.as_str())
                    || namespace_changed(&record, namespace.as_ref())
                {
                    if record.resource_id.is_none() {
                        info!(resource = %uid, "adopted existing resource");
                    }
                    record.resource_id = Some(uid);
                    record.namespace_id = namespace.map(|ns| ns.uid);
                    self.joins.save(&record).await?;
                } else {
                    debug!("resource updated in place");
                }
            }
            None => {
                let placement = Placement {
                    cluster,
                    namespace: namespace.as_ref().map(|ns| ns.name.as_str()),
                };
                let desired = self.projector.build_create(template, &placement)?;
                let created = self
                    .ctx
                    .client
                    .create(cluster, &target, to_dynamic(&desired)?)
                    .await?;
                let uid = resource_uid(&created)?;
                record.resource_id = Some(uid.clone());
                record.namespace_id = namespace.map(|ns| ns.uid);
                self.joins.save(&record).await?;
                info!(resource = %uid, "resource created");

                let _resource_lock = self
                    .ctx
                    .locks
                    .lock_object(&resource_key(P::KIND, &uid))
                    .await?;
                self.ctx
                    .post_create
                    .on_created(P::KIND, cluster, &created)
                    .await?;
            }
        }
        Ok(record)
    }

    /// Existing remote resource, by id first, then by name
    async fn find_existing(
        &self,
        template: &FederatedTemplate<P::Spec>,
        cluster: &Cluster,
        target: &ResourceTarget,
        record: &JoinRecord,
    ) -> Result<Option<DynamicObject>> {
        if let Some(uid) = &record.resource_id {
            let found = self
                .fetch_existing(cluster, target, &ResourceLookup::Id(uid.clone()))
                .await?;
            if found.is_some() {
                return Ok(found);
            }
            warn!(resource = %uid, "recorded resource not found, looking up by name");
        }
        self.fetch_existing(
            cluster,
            target,
            &ResourceLookup::Name(template.name().to_string()),
        )
        .await
    }

    /// NotFound means absent; every other failure is reported as transient
    async fn fetch_existing(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        lookup: &ResourceLookup,
    ) -> Result<Option<DynamicObject>> {
        match self.ctx.client.fetch(cluster, target, lookup).await {
            Ok(found) => Ok(found),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == ErrorKind::TransientIo => Err(e),
            Err(e) => Err(Error::transient(
                cluster.name.clone(),
                format!("fetching {} failed: {}", P::KIND.resource_kind(), e),
            )
            .into()),
        }
    }

    /// Reconcile every attached cluster in the background
    ///
    /// Status moves to `Syncing`, then `Active` or `SyncFail`.
    pub async fn start_sync_task(self: &Arc<Self>, template_id: &str) -> Result<TaskHandle> {
        self.schedule_sync(template_id, TaskKind::Sync).await
    }

    /// Push an updated template to every attached cluster in the background
    ///
    /// Status moves to `Syncing`, then `Active` or `UpdateFail`.
    pub async fn start_update_task(self: &Arc<Self>, template_id: &str) -> Result<TaskHandle> {
        self.schedule_sync(template_id, TaskKind::Update).await
    }

    async fn schedule_sync(self: &Arc<Self>, template_id: &str, kind: TaskKind) -> Result<TaskHandle> {
        self.templates
            .set_status(template_id, TemplateStatus::Syncing)
            .await?;
        let engine = Arc::clone(self);
        let id = template_id.to_string();
        let task = async move { engine.run_sync(&id, kind).await }.boxed();
        Ok(self.ctx.tasks.schedule(kind, template_id.to_string(), task))
    }

    async fn run_sync(&self, template_id: &str, kind: TaskKind) -> Result<()> {
        let (action, failed_status) = match kind {
            TaskKind::Update => (AuditAction::Update, TemplateStatus::UpdateFail),
            _ => (AuditAction::Sync, TemplateStatus::SyncFail),
        };
        let template = self.templates.get(template_id).await?;
        let records = self.joins.list_by_template(template_id).await?;
        let total = records.len();

        let outcomes = join_all(records.into_iter().map(|record| {
            let template = &template;
            async move {
                let cluster_id = record.cluster_id.clone();
                let result = match self
                    .ctx
                    .clusters
                    .resolve(&ClusterRef::id(cluster_id.clone()))
                    .await
                {
                    Ok(cluster) => self.reconcile_on(template, &cluster, record).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                (cluster_id, result)
            }
        }))
        .await;

        let failures: Vec<(String, FederationError)> = outcomes
            .into_iter()
            .filter_map(|(cluster, result)| result.err().map(|e| (cluster, e)))
            .collect();

        let result = if failures.is_empty() {
            self.templates
                .set_status(template_id, TemplateStatus::Active)
                .await?;
            info!(template = %template_id, clusters = total, "sync complete");
            Ok(())
        } else {
            self.templates.set_status(template_id, failed_status).await?;
            warn!(template = %template_id, failed = failures.len(), clusters = total, "sync failed");
            Err(FederationError::SyncFailed {
                kind: P::KIND,
                template_id: template_id.to_string(),
                failures,
            })
        };
        self.audit(action, self.audit_object(&template), &result, None)
            .await;
        result
    }

    /// Replace a template's spec and push it to every attached cluster
    ///
    /// Name, domain and namespace placement are immutable.
    #[instrument(skip(self, template), fields(kind = %P::KIND, template = %template.meta.id))]
    pub async fn update_template(
        self: &Arc<Self>,
        template: FederatedTemplate<P::Spec>,
    ) -> Result<TaskHandle> {
        let current = self.templates.get(template.id()).await?;
        if current.name() != template.name() {
            return Err(Error::validation_for_field(
                P::KIND.keyword(),
                "metadata.name",
                format!(
                    "name is immutable: {} cannot become {}",
                    current.name(),
                    template.name()
                ),
            )
            .into());
        }
        self.projector.validate_update(&current, &template)?;

        let updated = FederatedTemplate {
            meta: current.meta.clone(),
            spec: template.spec,
        };
        let id = updated.id().to_string();
        self.templates.put(updated).await?;
        self.start_update_task(&id).await
    }

    /// Delete a template; `NotEmpty` while any cluster is attached
    #[instrument(skip(self), fields(kind = %P::KIND))]
    pub async fn delete_template(&self, template_id: &str) -> Result<()> {
        let template = self.templates.get(template_id).await?;
        let result = self.delete_guarded(&template).await;
        self.audit(AuditAction::Delete, self.audit_object(&template), &result, None)
            .await;
        result
    }

    async fn delete_guarded(&self, template: &FederatedTemplate<P::Spec>) -> Result<()> {
        let _lock = self
            .ctx
            .locks
            .lock_object(&template_key(P::KIND, template.id()))
            .await?;
        let attached = self.joins.list_by_template(template.id()).await?;
        if !attached.is_empty() {
            return Err(Error::not_empty(
                P::KIND.keyword(),
                template.name(),
                format!("still attached to {} cluster(s)", attached.len()),
            )
            .into());
        }
        if let Some(guard) = &self.delete_guard {
            guard.check_delete(template.id()).await?;
        }
        self.templates.delete(template.id()).await
    }

    /// Clusters a template is attached to
    pub async fn attached_clusters(&self, template_id: &str) -> Result<Vec<Cluster>> {
        let mut clusters = Vec::new();
        for record in self.joins.list_by_template(template_id).await? {
            clusters.push(
                self.ctx
                    .clusters
                    .resolve(&ClusterRef::id(record.cluster_id))
                    .await?,
            );
        }
        Ok(clusters)
    }

    /// Ensure the federated namespace is on the cluster, then attach there
    ///
    /// Runs as a task. The namespace is attached (or re-synced if its cluster
    /// namespace disappeared), the task waits for it to become `Active`, then
    /// the template is attached. `Precondition` if the namespace never
    /// becomes active within the configured timeout.
    pub async fn attach_namespaced(
        self: &Arc<Self>,
        template_id: &str,
        cluster: &ClusterRef,
    ) -> Result<TaskHandle> {
        if !P::KIND.is_namespaced() {
            return Err(Error::validation_for(
                P::KIND.keyword(),
                "only namespaced kinds are attached through their namespace",
            )
            .into());
        }
        let template = self.templates.get(template_id).await?;
        let namespace_id = self.federated_namespace_id(&template)?.to_string();
        let resolver = self.resolver()?.clone();
        let cluster = self.ctx.clusters.resolve(cluster).await?;

        let engine = Arc::clone(self);
        let id = template_id.to_string();
        let timeout = self.ctx.config.namespace_ready_timeout;
        let interval = self.ctx.config.namespace_poll_interval;
        let task = async move {
            resolver.ensure_attached(&namespace_id, &cluster).await?;
            resolver
                .wait_active(&namespace_id, &cluster, timeout, interval)
                .await?;
            engine
                .attach(&id, &ClusterRef::id(cluster.id.clone()))
                .await
                .map(|_| ())
        }
        .boxed();
        Ok(self
            .ctx
            .tasks
            .schedule(TaskKind::NamespacedAttach, template_id.to_string(), task))
    }

    /// Describe the join of a template on a cluster
    pub async fn details(&self, template_id: &str, cluster: &ClusterRef) -> Result<JoinDetails> {
        let template = self.templates.get(template_id).await?;
        let cluster = self.ctx.clusters.resolve(cluster).await?;
        let record = self
            .joins
            .lookup(template_id, &cluster.id)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    P::KIND.keyword(),
                    format!("{} (not attached to cluster {})", template.name(), cluster.name),
                )
            })?;

        let namespace = match P::KIND.scope() {
            ResourceScope::Cluster => None,
            ResourceScope::Namespaced => {
                let namespace_id = self.federated_namespace_id(&template)?;
                match self.resolver()?.resolve(namespace_id, &cluster).await {
                    Ok(ns) => Some(ns),
                    Err(e) if e.kind() == ErrorKind::Precondition => None,
                    Err(e) => return Err(e),
                }
            }
        };

        let status = match (&record.resource_id, &namespace, P::KIND.scope()) {
            (None, _, _) => BindStatus::NotBind,
            (Some(_), None, ResourceScope::Namespaced) => BindStatus::Missing,
            (Some(uid), ns, _) => {
                let target = ResourceTarget {
                    kind: P::KIND,
                    namespace: ns.as_ref().map(|n| n.name.clone()),
                };
                match self
                    .fetch_existing(&cluster, &target, &ResourceLookup::Id(uid.clone()))
                    .await?
                {
                    Some(_) => BindStatus::Bound,
                    None => BindStatus::Missing,
                }
            }
        };

        Ok(JoinDetails {
            join_id: record.id,
            keyword: P::KIND.keyword(),
            template_id: template.meta.id.clone(),
            template_name: template.meta.name.clone(),
            cluster_id: cluster.id,
            cluster_name: cluster.name,
            namespace: namespace.map(|ns| ns.name),
            resource_id: record.resource_id,
            status,
        })
    }

    /// Drop every join record of this kind on a removed cluster
    #[instrument(skip(self), fields(kind = %P::KIND))]
    pub async fn purge_cluster(&self, cluster_id: &str) -> Result<usize> {
        let records = self.joins.list_by_cluster(cluster_id).await?;
        let mut purged = 0;
        for record in records.into_iter().filter(|r| r.kind == P::KIND) {
            let _lock = self
                .ctx
                .locks
                .lock_object(&template_key(P::KIND, &record.federated_template_id))
                .await?;
            match self.joins.delete(&record).await {
                Ok(()) => purged += 1,
                // Detached concurrently.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
            let name = match self.templates.get(&record.federated_template_id).await {
                Ok(t) => t.meta.name,
                Err(_) => record.federated_template_id.clone(),
            };
            self.audit(
                AuditAction::Detach,
                AuditObject::template(P::KIND.keyword(), &record.federated_template_id, name)
                    .on_cluster(cluster_id),
                &Ok::<(), FederationError>(()),
                Some("cluster removed".to_string()),
            )
            .await;
        }
        if purged > 0 {
            info!(cluster = %cluster_id, purged, "purged join records");
        }
        Ok(purged)
    }
}

fn namespace_changed(record: &JoinRecord, namespace: Option<&ResolvedNamespace>) -> bool {
    match namespace {
        Some(ns) => record.namespace_id.as_deref() != Some(ns.uid.as_str()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_client::MockClusterClient;
    use crate::context::MockPostCreateHook;
    use crate::kinds::{ClusterRoleProjector, FederatedClusterRoleSpec};
    use crate::lock::{KeyedLockManager, LockManager, ObjectLock};
    use crate::testing::{cluster, rule, viewer, Harness};
    use k8s_openapi::api::rbac::v1::ClusterRole;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use lattice_common::FederationConfig;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn viewer_role(h: &Harness, cluster_id: &str) -> Option<ClusterRole> {
        h.client
            .get::<ClusterRole>(cluster_id, FederatedKind::ClusterRole, None, "viewer")
    }

    /// Story: the viewer ClusterRole is attached, created, then updated in place
    #[tokio::test]
    async fn story_viewer_is_created_then_updated_in_place() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = h.federation.cluster_roles.clone();
        let r1 = rule(&["get"], &["pods"]);
        let r2 = rule(&["list"], &["pods"]);

        let template = engine
            .create_template(viewer(vec![r1.clone()]))
            .await
            .unwrap();
        assert_eq!(template.meta.status, TemplateStatus::Active);

        let record = engine.attach(template.id(), &ClusterRef::name("cluster-a")).await.unwrap();
        let uid = record.resource_id.clone().expect("provisioned on attach");
        let role = viewer_role(&h, "a").unwrap();
        assert_eq!(role.rules, Some(vec![r1.clone()]));
        assert_eq!(role.metadata.uid.as_deref(), Some(uid.as_str()));

        let mut changed = template.clone();
        changed.spec.template.rules = vec![r1.clone(), r2.clone()];
        engine.update_template(changed).await.unwrap().wait(WAIT).await.unwrap();

        let role = viewer_role(&h, "a").unwrap();
        assert_eq!(role.rules, Some(vec![r1, r2]));
        let stored = engine.joins().lookup(template.id(), "a").await.unwrap().unwrap();
        assert_eq!(stored.resource_id, Some(uid));
        assert_eq!(h.client.creates(), 1);
        assert_eq!(
            engine.template(template.id()).await.unwrap().meta.status,
            TemplateStatus::Active
        );
        assert_eq!(
            h.audit.actions(),
            vec![AuditAction::Attach, AuditAction::Sync, AuditAction::Update]
        );
    }

    #[tokio::test]
    async fn second_attach_conflicts() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();

        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();
        let err = engine
            .attach(template.id(), &ClusterRef::name("cluster-a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(engine.joins().list_by_template(template.id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attach_to_unknown_cluster_is_not_found() {
        let h = Harness::new(&[]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        let err = engine
            .attach(template.id(), &ClusterRef::name("nowhere"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn detach_without_attach_is_not_found() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        let err = engine.detach(template.id(), &ClusterRef::id("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("not attached"));
    }

    #[tokio::test]
    async fn detach_orphans_the_resource_by_default() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();

        engine.detach(template.id(), &ClusterRef::id("a")).await.unwrap();
        assert!(engine.joins().lookup(template.id(), "a").await.unwrap().is_none());
        assert!(viewer_role(&h, "a").is_some());
        assert_eq!(h.client.deletes(), 0);
    }

    #[tokio::test]
    async fn detach_with_delete_policy_removes_the_resource() {
        let config = FederationConfig {
            detach_policy: DetachPolicy::Delete,
            ..Harness::config()
        };
        let h = Harness::with_config(config, &[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();

        engine.detach(template.id(), &ClusterRef::id("a")).await.unwrap();
        assert!(viewer_role(&h, "a").is_none());
        assert_eq!(h.client.deletes(), 1);
    }

    /// Story: remote cleanup fails after the record is gone; the error says so
    #[tokio::test]
    async fn story_detach_cleanup_failure_is_reported_as_partial() {
        let config = FederationConfig {
            detach_policy: DetachPolicy::Delete,
            ..Harness::config()
        };
        let h = Harness::with_config(config, &[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();

        h.client.set_unreachable("a", true);
        let err = engine.detach(template.id(), &ClusterRef::id("a")).await.unwrap_err();
        assert!(matches!(err, FederationError::DetachedNotCleaned { .. }));
        assert!(err.is_retryable());
        assert!(engine.joins().lookup(template.id(), "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_refused_while_attached() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();

        let err = engine.delete_template(template.id()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEmpty);

        engine.detach(template.id(), &ClusterRef::id("a")).await.unwrap();
        engine.delete_template(template.id()).await.unwrap();
        assert_eq!(
            engine.template(template.id()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn reconcile_twice_is_a_no_op_update() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine
            .create_template(viewer(vec![rule(&["get"], &["pods"])]))
            .await
            .unwrap();
        let record = engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();
        let before = viewer_role(&h, "a").unwrap();

        let first = engine.reconcile_resource(&record).await.unwrap();
        let second = engine.reconcile_resource(&first).await.unwrap();
        let after = viewer_role(&h, "a").unwrap();

        assert_eq!(second.resource_id, record.resource_id);
        assert_eq!(after.rules, before.rules);
        assert_eq!(after.metadata.labels, before.metadata.labels);
        assert_eq!(h.client.creates(), 1);
        assert_eq!(h.client.updates(), 2);
    }

    #[tokio::test]
    async fn existing_resource_with_same_name_is_adopted() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let seeded = h.client.seed(
            "a",
            FederatedKind::ClusterRole,
            &ClusterRole {
                metadata: ObjectMeta {
                    name: Some("viewer".to_string()),
                    ..Default::default()
                },
                rules: Some(vec![]),
                aggregation_rule: None,
            },
        );
        let engine = &h.federation.cluster_roles;
        let template = engine
            .create_template(viewer(vec![rule(&["get"], &["pods"])]))
            .await
            .unwrap();

        let record = engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();
        assert_eq!(record.resource_id, seeded.metadata.uid);
        assert_eq!(h.client.creates(), 0);
        assert_eq!(
            viewer_role(&h, "a").unwrap().rules,
            Some(vec![rule(&["get"], &["pods"])])
        );
    }

    #[tokio::test]
    async fn resource_deleted_out_of_band_is_recreated() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        let record = engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();

        h.client.remove("a", FederatedKind::ClusterRole, None, "viewer");
        let healed = engine.reconcile_resource(&record).await.unwrap();
        assert!(healed.resource_id.is_some());
        assert_ne!(healed.resource_id, record.resource_id);
        assert!(viewer_role(&h, "a").is_some());
    }

    /// Story: cluster down at attach; the record survives and a later sync provisions it
    #[tokio::test]
    async fn story_attach_failure_leaves_a_retryable_record() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();

        h.client.set_unreachable("a", true);
        let err = engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        let persisted = err.persisted_record().cloned().expect("record persisted");
        assert!(!persisted.is_provisioned());
        assert!(err.to_string().contains("reconcile federatedclusterrole"));

        h.client.set_unreachable("a", false);
        let record = engine.sync_cluster(template.id(), &ClusterRef::id("a")).await.unwrap();
        assert_eq!(record.id, persisted.id);
        assert!(record.is_provisioned());
    }

    #[tokio::test]
    async fn non_not_found_fetch_errors_become_transient() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let mut client = MockClusterClient::new();
        client
            .expect_fetch()
            .returning(|_, _, _| Err(Error::internal("api server returned garbage").into()));
        client.expect_create().never();

        let ctx = Arc::new(
            FederationContext::builder(h.clusters.clone())
                .cluster_client(Arc::new(client))
                .build(),
        );
        let engine = ReconciliationEngine::new(
            ctx,
            ClusterRoleProjector,
            h.stores.cluster_roles.clone(),
            h.stores.joins.clone(),
        );
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        let err = engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[tokio::test]
    async fn post_create_hook_runs_once_per_creation() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let mut hook = MockPostCreateHook::new();
        hook.expect_on_created()
            .times(1)
            .withf(|kind, cluster, resource| {
                *kind == FederatedKind::ClusterRole
                    && cluster.id == "a"
                    && resource.metadata.name.as_deref() == Some("viewer")
            })
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(
            FederationContext::builder(h.clusters.clone())
                .cluster_client(h.client.clone())
                .post_create_hook(Arc::new(hook))
                .build(),
        );
        let engine = ReconciliationEngine::new(
            ctx,
            ClusterRoleProjector,
            h.stores.cluster_roles.clone(),
            h.stores.joins.clone(),
        );
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        let record = engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();
        engine.reconcile_resource(&record).await.unwrap();
    }

    #[tokio::test]
    async fn sync_task_reports_each_failed_cluster() {
        let h = Harness::new(&[cluster("a", "cluster-a"), cluster("b", "cluster-b")]);
        let engine = h.federation.cluster_roles.clone();
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("b")).await.unwrap();

        h.client.set_unreachable("b", true);
        let err = engine
            .start_sync_task(template.id())
            .await
            .unwrap()
            .wait(WAIT)
            .await
            .unwrap_err();
        match &err {
            FederationError::SyncFailed { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "b");
            }
            other => panic!("expected SyncFailed, got {other}"),
        }
        assert_eq!(
            engine.template(template.id()).await.unwrap().meta.status,
            TemplateStatus::SyncFail
        );

        h.client.set_unreachable("b", false);
        engine
            .start_sync_task(template.id())
            .await
            .unwrap()
            .wait(WAIT)
            .await
            .unwrap();
        assert_eq!(
            engine.template(template.id()).await.unwrap().meta.status,
            TemplateStatus::Active
        );
    }

    #[tokio::test]
    async fn failed_update_marks_template() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = h.federation.cluster_roles.clone();
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();

        h.client.set_unreachable("a", true);
        let mut changed = template.clone();
        changed.spec.template.rules = vec![rule(&["get"], &["secrets"])];
        let result = engine.update_template(changed).await.unwrap().wait(WAIT).await;
        assert!(result.is_err());
        assert_eq!(
            engine.template(template.id()).await.unwrap().meta.status,
            TemplateStatus::UpdateFail
        );
    }

    #[tokio::test]
    async fn rename_on_update_is_rejected() {
        let h = Harness::new(&[]);
        let engine = h.federation.cluster_roles.clone();
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        let mut renamed = template.clone();
        renamed.meta.name = "editor".to_string();
        let err = engine.update_template(renamed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(err.to_string().contains("immutable"));
    }

    #[tokio::test]
    async fn details_show_bind_state() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();

        h.client.set_unreachable("a", true);
        let _ = engine.attach(template.id(), &ClusterRef::id("a")).await;
        h.client.set_unreachable("a", false);
        let details = engine.details(template.id(), &ClusterRef::id("a")).await.unwrap();
        assert_eq!(details.status, BindStatus::NotBind);
        assert_eq!(details.cluster_name, "cluster-a");
        assert_eq!(details.keyword, "federatedclusterrole");

        engine.sync_cluster(template.id(), &ClusterRef::id("a")).await.unwrap();
        let details = engine.details(template.id(), &ClusterRef::id("a")).await.unwrap();
        assert_eq!(details.status, BindStatus::Bound);

        h.client.remove("a", FederatedKind::ClusterRole, None, "viewer");
        let details = engine.details(template.id(), &ClusterRef::id("a")).await.unwrap();
        assert_eq!(details.status, BindStatus::Missing);
    }

    #[tokio::test]
    async fn purge_drops_only_the_removed_cluster() {
        let h = Harness::new(&[cluster("a", "cluster-a"), cluster("b", "cluster-b")]);
        let engine = &h.federation.cluster_roles;
        let template = engine.create_template(viewer(vec![])).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap();
        engine.attach(template.id(), &ClusterRef::id("b")).await.unwrap();

        assert_eq!(engine.purge_cluster("a").await.unwrap(), 1);
        let remaining = engine.attached_clusters(template.id()).await.unwrap();
        assert_eq!(remaining.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(engine.purge_cluster("a").await.unwrap(), 0);
    }

    /// Deletes the template just before handing out its template lock
    struct DeleteBeforeLock {
        inner: KeyedLockManager,
        templates: Arc<dyn TemplateStore<FederatedClusterRoleSpec>>,
        template_id: std::sync::Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl LockManager for DeleteBeforeLock {
        async fn lock_object(&self, key: &str) -> Result<ObjectLock> {
            let victim = self.template_id.lock().unwrap().take();
            if let Some(id) = victim {
                if key == template_key(FederatedKind::ClusterRole, &id) {
                    self.templates.delete(&id).await?;
                }
            }
            self.inner.lock_object(key).await
        }
    }

    #[tokio::test]
    async fn attach_loses_to_a_concurrent_delete() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let template = h
            .federation
            .cluster_roles
            .create_template(viewer(vec![rule(&["get"], &["pods"])]))
            .await
            .unwrap();
        let locks = DeleteBeforeLock {
            inner: KeyedLockManager::new(Duration::from_secs(1)),
            templates: h.stores.cluster_roles.clone(),
            template_id: std::sync::Mutex::new(Some(template.id().to_string())),
        };
        let ctx = Arc::new(
            FederationContext::builder(h.clusters.clone())
                .cluster_client(h.client.clone())
                .lock_manager(Arc::new(locks))
                .config(Harness::config())
                .build(),
        );
        let engine = ReconciliationEngine::new(
            ctx,
            ClusterRoleProjector,
            h.stores.cluster_roles.clone(),
            h.stores.joins.clone(),
        );

        let err = engine.attach(template.id(), &ClusterRef::id("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.persisted_record().is_none());
        assert!(h.stores.joins.list_by_template(template.id()).await.unwrap().is_empty());
        assert!(viewer_role(&h, "a").is_none());
        assert_eq!(h.client.creates(), 0);
    }

    #[tokio::test]
    async fn concurrent_attaches_yield_one_record() {
        let h = Harness::new(&[cluster("a", "cluster-a")]);
        let engine = h.federation.cluster_roles.clone();
        let template = engine.create_template(viewer(vec![])).await.unwrap();

        let attempts = (0..4).map(|_| {
            let engine = engine.clone();
            let id = template.id().to_string();
            tokio::spawn(async move { engine.attach(&id, &ClusterRef::id("a")).await })
        });
        let results = join_all(attempts).await;
        let succeeded = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(succeeded, 1);
        assert_eq!(h.client.creates(), 1);
    }
}
