//! Persistence seams for join records and federated templates
//!
//! The real backing store is external; the engine only depends on these
//! traits. In-memory implementations back tests and single-process setups.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[cfg(test)]
use mockall::automock;

use lattice_common::Error;

use crate::model::{FederatedKind, FederatedTemplate, JoinRecord, TemplateStatus};
use crate::Result;

/// Join record persistence
///
/// `insert` must enforce uniqueness of (template, cluster) atomically; that
/// constraint, not the engine's lock, is the source of truth for "already
/// attached".
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoinRecordStore: Send + Sync {
    /// Persist a new record; `Conflict` if the pair is already joined
    async fn insert(&self, record: JoinRecord) -> Result<JoinRecord>;

    /// Record for the (template, cluster) pair
    async fn lookup(&self, template_id: &str, cluster_id: &str) -> Result<Option<JoinRecord>>;

    /// Overwrite an existing record. A set `resource_id` can never be cleared.
    async fn save(&self, record: &JoinRecord) -> Result<()>;

    /// Remove a record; `NotFound` if it is gone
    async fn delete(&self, record: &JoinRecord) -> Result<()>;

    /// Every record of a template
    async fn list_by_template(&self, template_id: &str) -> Result<Vec<JoinRecord>>;

    /// Every record targeting a cluster
    async fn list_by_cluster(&self, cluster_id: &str) -> Result<Vec<JoinRecord>>;
}

/// In-memory [`JoinRecordStore`] keyed by (template, cluster)
#[derive(Default)]
pub struct InMemoryJoinStore {
    records: DashMap<(String, String), JoinRecord>,
}

impl InMemoryJoinStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn key(template_id: &str, cluster_id: &str) -> (String, String) {
        (template_id.to_string(), cluster_id.to_string())
    }
}

#[async_trait]
impl JoinRecordStore for InMemoryJoinStore {
    async fn insert(&self, record: JoinRecord) -> Result<JoinRecord> {
        match self
            .records
            .entry(Self::key(&record.federated_template_id, &record.cluster_id))
        {
            Entry::Occupied(_) => Err(Error::conflict(
                record.kind.keyword(),
                record.federated_template_id.clone(),
                format!("already attached to cluster {}", record.cluster_id),
            )
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn lookup(&self, template_id: &str, cluster_id: &str) -> Result<Option<JoinRecord>> {
        Ok(self
            .records
            .get(&Self::key(template_id, cluster_id))
            .map(|r| r.value().clone()))
    }

    async fn save(&self, record: &JoinRecord) -> Result<()> {
        let key = Self::key(&record.federated_template_id, &record.cluster_id);
        let mut current = self
            .records
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("joinrecord", record.id.clone()))?;
        if current.id != record.id {
            return Err(Error::conflict(
                "joinrecord",
                record.id.clone(),
                "pair was re-attached under a different record",
            )
            .into());
        }
        if current.resource_id.is_some() && record.resource_id.is_none() {
            return Err(Error::internal_with_context(
                "join-store",
                format!("refusing to clear resource id of join {}", record.id),
            )
            .into());
        }
        *current = record.clone();
        Ok(())
    }

    async fn delete(&self, record: &JoinRecord) -> Result<()> {
        let key = Self::key(&record.federated_template_id, &record.cluster_id);
        self.records
            .remove_if(&key, |_, current| current.id == record.id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("joinrecord", record.id.clone()).into())
    }

    async fn list_by_template(&self, template_id: &str) -> Result<Vec<JoinRecord>> {
        let mut records: Vec<JoinRecord> = self
            .records
            .iter()
            .filter(|r| r.federated_template_id == template_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        Ok(records)
    }

    async fn list_by_cluster(&self, cluster_id: &str) -> Result<Vec<JoinRecord>> {
        let mut records: Vec<JoinRecord> = self
            .records
            .iter()
            .filter(|r| r.cluster_id == cluster_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.federated_template_id.cmp(&b.federated_template_id));
        Ok(records)
    }
}

/// Federated template persistence for one kind
#[async_trait]
pub trait TemplateStore<S>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
{
    /// Template by id; `NotFound` if missing
    async fn get(&self, id: &str) -> Result<FederatedTemplate<S>>;

    /// Template by name, if any
    async fn find_by_name(&self, name: &str) -> Result<Option<FederatedTemplate<S>>>;

    /// Insert a new template; `Conflict` on duplicate id or name
    async fn create(&self, template: FederatedTemplate<S>) -> Result<FederatedTemplate<S>>;

    /// Replace an existing template
    async fn put(&self, template: FederatedTemplate<S>) -> Result<()>;

    /// Set the lifecycle status
    async fn set_status(&self, id: &str, status: TemplateStatus) -> Result<()>;

    /// Remove a template; `NotFound` if missing
    async fn delete(&self, id: &str) -> Result<()>;

    /// Templates placed in a federated namespace
    async fn list_in_namespace(&self, federated_namespace_id: &str)
        -> Result<Vec<FederatedTemplate<S>>>;
}

/// In-memory [`TemplateStore`]
pub struct InMemoryTemplateStore<S> {
    kind: FederatedKind,
    templates: DashMap<String, FederatedTemplate<S>>,
}

impl<S> InMemoryTemplateStore<S> {
    /// Create an empty store for `kind`
    pub fn new(kind: FederatedKind) -> Self {
        Self {
            kind,
            templates: DashMap::new(),
        }
    }
}

#[async_trait]
impl<S> TemplateStore<S> for InMemoryTemplateStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn get(&self, id: &str) -> Result<FederatedTemplate<S>> {
        self.templates
            .get(id)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::not_found(self.kind.keyword(), id).into())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<FederatedTemplate<S>>> {
        Ok(self
            .templates
            .iter()
            .find(|t| t.meta.name == name)
            .map(|t| t.value().clone()))
    }

    async fn create(&self, template: FederatedTemplate<S>) -> Result<FederatedTemplate<S>> {
        if self.find_by_name(&template.meta.name).await?.is_some() {
            return Err(Error::conflict(
                self.kind.keyword(),
                template.meta.name.clone(),
                "name already in use",
            )
            .into());
        }
        match self.templates.entry(template.meta.id.clone()) {
            Entry::Occupied(_) => Err(Error::conflict(
                self.kind.keyword(),
                template.meta.id.clone(),
                "id already in use",
            )
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(template.clone());
                Ok(template)
            }
        }
    }

    async fn put(&self, template: FederatedTemplate<S>) -> Result<()> {
        let mut current = self
            .templates
            .get_mut(&template.meta.id)
            .ok_or_else(|| Error::not_found(self.kind.keyword(), template.meta.id.clone()))?;
        *current = template;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: TemplateStatus) -> Result<()> {
        let mut current = self
            .templates
            .get_mut(id)
            .ok_or_else(|| Error::not_found(self.kind.keyword(), id))?;
        current.meta.status = status;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.templates
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(self.kind.keyword(), id).into())
    }

    async fn list_in_namespace(
        &self,
        federated_namespace_id: &str,
    ) -> Result<Vec<FederatedTemplate<S>>> {
        Ok(self
            .templates
            .iter()
            .filter(|t| t.meta.federated_namespace_id.as_deref() == Some(federated_namespace_id))
            .map(|t| t.value().clone())
            .collect())
    }
}

/// Kind-erased view of a template store, used by cross-kind guards
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespacedTemplateIndex: Send + Sync {
    /// Kind of the indexed templates
    fn kind(&self) -> FederatedKind;

    /// Names of templates placed in the federated namespace
    async fn names_in_namespace(&self, federated_namespace_id: &str) -> Result<Vec<String>>;
}

/// Adapts a typed [`TemplateStore`] to [`NamespacedTemplateIndex`]
pub struct TemplateIndex<S: Clone + Send + Sync + 'static> {
    kind: FederatedKind,
    store: Arc<dyn TemplateStore<S>>,
}

impl<S: Clone + Send + Sync + 'static> TemplateIndex<S> {
    /// Index `store`, whose templates are of `kind`
    pub fn new(kind: FederatedKind, store: Arc<dyn TemplateStore<S>>) -> Self {
        Self { kind, store }
    }
}

#[async_trait]
impl<S> NamespacedTemplateIndex for TemplateIndex<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn kind(&self) -> FederatedKind {
        self.kind
    }

    async fn names_in_namespace(&self, federated_namespace_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_in_namespace(federated_namespace_id)
            .await?
            .into_iter()
            .map(|t| t.meta.name)
            .collect())
    }
}
