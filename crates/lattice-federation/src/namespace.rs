//! Cluster namespace resolution for namespaced kinds
//!
//! Roles and role bindings live in a federated namespace, which has its own
//! join records through the namespace engine. Resolution follows template,
//! federated namespace, the namespace's join on the cluster, then the cluster
//! namespace by name. Nothing here provisions namespaces as a side effect of
//! reconcile; [`NamespaceResolver::ensure_attached`] is only called by the
//! explicit namespaced attach task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use lattice_common::kube_utils::poll_until;
use lattice_common::{Error, ErrorKind};

use crate::cluster_client::{from_dynamic, resource_uid, ResourceLookup, ResourceTarget};
use crate::engine::ReconciliationEngine;
use crate::kinds::{namespace_is_active, FederatedNamespaceSpec, NamespaceProjector};
use crate::model::{Cluster, ClusterRef, FederatedKind, FederatedTemplate};
use crate::store::NamespacedTemplateIndex;
use crate::Result;

/// Cluster namespace backing a federated namespace on one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNamespace {
    /// Namespace name
    pub name: String,
    /// Namespace uid
    pub uid: String,
}

/// Resolves federated namespaces to cluster namespaces
#[derive(Clone)]
pub struct NamespaceResolver {
    engine: Arc<ReconciliationEngine<NamespaceProjector>>,
}

impl NamespaceResolver {
    /// Resolver backed by the namespace engine
    pub fn new(engine: Arc<ReconciliationEngine<NamespaceProjector>>) -> Self {
        Self { engine }
    }

    /// Federated namespace template; `NotFound` if missing
    pub async fn template(
        &self,
        federated_namespace_id: &str,
    ) -> Result<FederatedTemplate<FederatedNamespaceSpec>> {
        self.engine.template(federated_namespace_id).await
    }

    async fn fetch(&self, cluster: &Cluster, name: &str) -> Result<Option<DynamicObject>> {
        self.engine
            .context()
            .client
            .fetch(
                cluster,
                &ResourceTarget::cluster_scoped(FederatedKind::Namespace),
                &ResourceLookup::Name(name.to_string()),
            )
            .await
    }

    /// Cluster namespace of `federated_namespace_id` on `cluster`
    ///
    /// `Precondition` if the federated namespace is not attached to the
    /// cluster or its namespace does not exist there.
    pub async fn resolve(
        &self,
        federated_namespace_id: &str,
        cluster: &Cluster,
    ) -> Result<ResolvedNamespace> {
        let template = self.template(federated_namespace_id).await?;
        self.engine
            .joins()
            .lookup(federated_namespace_id, &cluster.id)
            .await?
            .ok_or_else(|| {
                Error::precondition(
                    FederatedKind::Namespace.keyword(),
                    template.name(),
                    format!("not attached to cluster {}", cluster.name),
                )
            })?;
        let namespace = self.fetch(cluster, template.name()).await?.ok_or_else(|| {
            Error::precondition(
                FederatedKind::Namespace.keyword(),
                template.name(),
                format!("namespace not provisioned in cluster {}", cluster.name),
            )
        })?;
        Ok(ResolvedNamespace {
            name: template.name().to_string(),
            uid: resource_uid(&namespace)?,
        })
    }

    /// Attach the federated namespace to `cluster`, or re-sync it if its
    /// cluster namespace is gone
    pub async fn ensure_attached(&self, federated_namespace_id: &str, cluster: &Cluster) -> Result<()> {
        let cluster_ref = ClusterRef::id(cluster.id.clone());
        match self
            .engine
            .joins()
            .lookup(federated_namespace_id, &cluster.id)
            .await?
        {
            None => match self.engine.attach(federated_namespace_id, &cluster_ref).await {
                Ok(_) => {
                    info!(namespace = %federated_namespace_id, cluster = %cluster.name, "attached federated namespace");
                    Ok(())
                }
                // Someone else attached it in the meantime.
                Err(e) if e.kind() == ErrorKind::Conflict => Ok(()),
                Err(e) => Err(e),
            },
            Some(record) => {
                let template = self.template(federated_namespace_id).await?;
                if self.fetch(cluster, template.name()).await?.is_none() {
                    debug!(namespace = %template.name(), cluster = %cluster.name, "namespace missing, re-syncing");
                    self.engine.reconcile_resource(&record).await?;
                }
                Ok(())
            }
        }
    }

    /// Wait until the cluster namespace reports `Active`
    ///
    /// `Precondition` after `timeout`.
    pub async fn wait_active(
        &self,
        federated_namespace_id: &str,
        cluster: &Cluster,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let template = self.template(federated_namespace_id).await?;
        let name = template.name();
        let resolver = self;
        poll_until(
            timeout,
            interval,
            Error::precondition(
                FederatedKind::Namespace.keyword(),
                name,
                format!("not active in cluster {} after {:?}", cluster.name, timeout),
            ),
            move || async move {
                let active = resolver
                    .fetch(cluster, name)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|object| from_dynamic::<Namespace>(object).ok())
                    .map(|ns| namespace_is_active(&ns))
                    .unwrap_or(false);
                Ok::<bool, Error>(active)
            },
        )
        .await?;
        Ok(())
    }
}

/// Extra check before a template is deleted
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeleteGuard: Send + Sync {
    /// `Ok` if the template may be deleted
    async fn check_delete(&self, template_id: &str) -> Result<()>;
}

/// Refuses to delete a federated namespace that still holds templates
pub struct NamespaceDependents {
    indexes: Vec<Arc<dyn NamespacedTemplateIndex>>,
}

impl NamespaceDependents {
    /// Guard over the namespaced kinds' template indexes
    pub fn new(indexes: Vec<Arc<dyn NamespacedTemplateIndex>>) -> Self {
        Self { indexes }
    }
}

#[async_trait]
impl DeleteGuard for NamespaceDependents {
    async fn check_delete(&self, template_id: &str) -> Result<()> {
        for index in &self.indexes {
            let names = index.names_in_namespace(template_id).await?;
            if !names.is_empty() {
                return Err(Error::not_empty(
                    FederatedKind::Namespace.keyword(),
                    template_id,
                    format!("{} still placed in it: {}", index.kind(), names.join(", ")),
                )
                .into());
            }
        }
        Ok(())
    }
}
