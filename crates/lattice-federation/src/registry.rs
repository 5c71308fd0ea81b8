//! Kind-erased access to every engine, and process-wide wiring
//!
//! [`Federation::new`] builds one engine per kind over shared stores and
//! registers each in a [`FederationDirectory`]. The directory is passed to
//! whatever needs cross-kind operations, such as purging a removed cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use lattice_common::Error;

use crate::context::FederationContext;
use crate::engine::{JoinDetails, ReconciliationEngine};
use crate::kinds::{
    ClusterRoleBindingProjector, ClusterRoleProjector, FederatedClusterRoleBindingSpec,
    FederatedClusterRoleSpec, FederatedNamespaceSpec, FederatedRoleBindingSpec, FederatedRoleSpec,
    NamespaceProjector, ResourceProjector, RoleBindingProjector, RoleLookup, RoleProjector,
    TemplateRoleLookup,
};
use crate::model::{ClusterRef, FederatedKind, JoinRecord};
use crate::namespace::{NamespaceDependents, NamespaceResolver};
use crate::store::{
    InMemoryJoinStore, InMemoryTemplateStore, JoinRecordStore, NamespacedTemplateIndex,
    TemplateIndex, TemplateStore,
};
use crate::Result;

/// Join record operations that do not need the template's type
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoinManager: Send + Sync {
    /// Kind managed
    fn kind(&self) -> FederatedKind;

    /// Join records of a template
    async fn attached(&self, template_id: &str) -> Result<Vec<JoinRecord>>;

    /// Join records of this kind on a cluster
    async fn joins_on_cluster(&self, cluster_id: &str) -> Result<Vec<JoinRecord>>;

    /// Remove every join record of this kind on a cluster
    async fn purge_cluster(&self, cluster_id: &str) -> Result<usize>;

    /// Describe one join
    async fn details(&self, template_id: &str, cluster: &ClusterRef) -> Result<JoinDetails>;
}

#[async_trait]
impl<P: ResourceProjector> JoinManager for ReconciliationEngine<P> {
    fn kind(&self) -> FederatedKind {
        P::KIND
    }

    async fn attached(&self, template_id: &str) -> Result<Vec<JoinRecord>> {
        self.joins().list_by_template(template_id).await
    }

    async fn joins_on_cluster(&self, cluster_id: &str) -> Result<Vec<JoinRecord>> {
        Ok(self
            .joins()
            .list_by_cluster(cluster_id)
            .await?
            .into_iter()
            .filter(|r| r.kind == P::KIND)
            .collect())
    }

    async fn purge_cluster(&self, cluster_id: &str) -> Result<usize> {
        ReconciliationEngine::purge_cluster(self, cluster_id).await
    }

    async fn details(&self, template_id: &str, cluster: &ClusterRef) -> Result<JoinDetails> {
        ReconciliationEngine::details(self, template_id, cluster).await
    }
}

/// Kind to join manager lookup
#[derive(Default)]
pub struct FederationDirectory {
    managers: BTreeMap<FederatedKind, Arc<dyn JoinManager>>,
}

impl FederationDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the manager of a kind; `Conflict` if one is already registered
    pub fn register(&mut self, manager: Arc<dyn JoinManager>) -> Result<()> {
        let kind = manager.kind();
        if self.managers.contains_key(&kind) {
            return Err(Error::conflict(
                "federation-directory",
                kind.keyword(),
                "a manager is already registered for this kind",
            )
            .into());
        }
        self.managers.insert(kind, manager);
        Ok(())
    }

    /// Manager of `kind`; `NotFound` if none
    pub fn get(&self, kind: FederatedKind) -> Result<Arc<dyn JoinManager>> {
        self.managers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::not_found("federation-directory", kind.keyword()).into())
    }

    /// Registered kinds
    pub fn kinds(&self) -> Vec<FederatedKind> {
        self.managers.keys().copied().collect()
    }

    /// Managers of namespaced kinds
    pub fn namespace_scoped(&self) -> Vec<Arc<dyn JoinManager>> {
        self.managers
            .iter()
            .filter(|(kind, _)| kind.is_namespaced())
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Remove every kind's join records on a cluster that is going away
    ///
    /// Dependents go first: namespaced kinds, then bindings, roles and
    /// namespaces.
    pub async fn purge_cluster(&self, cluster_id: &str) -> Result<usize> {
        let mut total = 0;
        for manager in self.managers.values().rev() {
            total += manager.purge_cluster(cluster_id).await?;
        }
        info!(cluster = %cluster_id, purged = total, "cluster purged from federation");
        Ok(total)
    }
}

/// Backing stores for every kind
#[derive(Clone)]
pub struct FederationStores {
    pub joins: Arc<dyn JoinRecordStore>,
    pub namespaces: Arc<dyn TemplateStore<FederatedNamespaceSpec>>,
    pub cluster_roles: Arc<dyn TemplateStore<FederatedClusterRoleSpec>>,
    pub cluster_role_bindings: Arc<dyn TemplateStore<FederatedClusterRoleBindingSpec>>,
    pub roles: Arc<dyn TemplateStore<FederatedRoleSpec>>,
    pub role_bindings: Arc<dyn TemplateStore<FederatedRoleBindingSpec>>,
}

impl FederationStores {
    /// In-memory stores
    pub fn in_memory() -> Self {
        Self {
            joins: Arc::new(InMemoryJoinStore::new()),
            namespaces: Arc::new(InMemoryTemplateStore::new(FederatedKind::Namespace)),
            cluster_roles: Arc::new(InMemoryTemplateStore::new(FederatedKind::ClusterRole)),
            cluster_role_bindings: Arc::new(InMemoryTemplateStore::new(
                FederatedKind::ClusterRoleBinding,
            )),
            roles: Arc::new(InMemoryTemplateStore::new(FederatedKind::Role)),
            role_bindings: Arc::new(InMemoryTemplateStore::new(FederatedKind::RoleBinding)),
        }
    }
}

/// Every engine, wired together
pub struct Federation {
    pub namespaces: Arc<ReconciliationEngine<NamespaceProjector>>,
    pub cluster_roles: Arc<ReconciliationEngine<ClusterRoleProjector>>,
    pub cluster_role_bindings: Arc<ReconciliationEngine<ClusterRoleBindingProjector>>,
    pub roles: Arc<ReconciliationEngine<RoleProjector>>,
    pub role_bindings: Arc<ReconciliationEngine<RoleBindingProjector>>,
    pub directory: FederationDirectory,
}

impl Federation {
    /// Build all engines over `stores`
    pub fn new(ctx: Arc<FederationContext>, stores: FederationStores) -> Result<Self> {
        let dependents: Vec<Arc<dyn NamespacedTemplateIndex>> = vec![
            Arc::new(TemplateIndex::new(FederatedKind::Role, stores.roles.clone())),
            Arc::new(TemplateIndex::new(
                FederatedKind::RoleBinding,
                stores.role_bindings.clone(),
            )),
        ];
        let namespaces = Arc::new(
            ReconciliationEngine::new(
                ctx.clone(),
                NamespaceProjector,
                stores.namespaces.clone(),
                stores.joins.clone(),
            )
            .with_delete_guard(Arc::new(NamespaceDependents::new(dependents))),
        );
        let resolver = NamespaceResolver::new(namespaces.clone());
        let role_lookup: Arc<dyn RoleLookup> = Arc::new(TemplateRoleLookup::new(
            stores.cluster_roles.clone(),
            stores.roles.clone(),
        ));

        let cluster_roles = Arc::new(ReconciliationEngine::new(
            ctx.clone(),
            ClusterRoleProjector,
            stores.cluster_roles.clone(),
            stores.joins.clone(),
        ));
        let cluster_role_bindings = Arc::new(ReconciliationEngine::new(
            ctx.clone(),
            ClusterRoleBindingProjector::new(role_lookup.clone()),
            stores.cluster_role_bindings.clone(),
            stores.joins.clone(),
        ));
        let roles = Arc::new(
            ReconciliationEngine::new(
                ctx.clone(),
                RoleProjector,
                stores.roles.clone(),
                stores.joins.clone(),
            )
            .with_namespaces(resolver.clone()),
        );
        let role_bindings = Arc::new(
            ReconciliationEngine::new(
                ctx,
                RoleBindingProjector::new(role_lookup),
                stores.role_bindings.clone(),
                stores.joins.clone(),
            )
            .with_namespaces(resolver),
        );

        let mut directory = FederationDirectory::new();
        directory.register(namespaces.clone())?;
        directory.register(cluster_roles.clone())?;
        directory.register(cluster_role_bindings.clone())?;
        directory.register(roles.clone())?;
        directory.register(role_bindings.clone())?;

        Ok(Self {
            namespaces,
            cluster_roles,
            cluster_role_bindings,
            roles,
            role_bindings,
            directory,
        })
    }
}
