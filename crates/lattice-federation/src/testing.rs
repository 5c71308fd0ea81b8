//! Test fakes and fixtures

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use lattice_common::audit::RecordingAuditSink;
use lattice_common::{Error, FederationConfig};

use crate::cluster_client::{from_dynamic, to_dynamic, ClusterClient, ResourceLookup, ResourceTarget};
use crate::cluster_directory::InMemoryClusterDirectory;
use crate::context::FederationContext;
use crate::fanout::{ApiGroupResources, ClusterUserGroups, ClusterUsers};
use crate::kinds::{
    ClusterRoleTemplate, FederatedClusterRoleSpec, FederatedNamespaceSpec,
};
use crate::lock::KeyedLockManager;
use crate::model::{Cluster, FederatedKind, FederatedTemplate};
use crate::registry::{Federation, FederationStores};
use crate::Result;

pub const DOMAIN: &str = "dom-1";

type ObjectKey = (String, FederatedKind, Option<String>, String);

/// Cluster client that keeps objects in memory and assigns uids
#[derive(Default)]
pub struct FakeClusterClient {
    objects: DashMap<ObjectKey, DynamicObject>,
    next_uid: AtomicU64,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    unreachable: DashSet<String>,
    namespaces_pending: AtomicBool,
    api_resources: DashMap<String, ApiGroupResources>,
    users: DashMap<String, ClusterUsers>,
    groups: DashMap<String, ClusterUserGroups>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, cluster_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(cluster_id.to_string());
        } else {
            self.unreachable.remove(cluster_id);
        }
    }

    /// New namespaces report phase Pending instead of Active
    pub fn set_namespaces_pending(&self, pending: bool) {
        self.namespaces_pending.store(pending, Ordering::SeqCst);
    }

    pub fn set_api_resources(&self, cluster_id: &str, resources: ApiGroupResources) {
        self.api_resources.insert(cluster_id.to_string(), resources);
    }

    pub fn set_users(&self, cluster_id: &str, users: ClusterUsers) {
        self.users.insert(cluster_id.to_string(), users);
    }

    pub fn set_groups(&self, cluster_id: &str, groups: ClusterUserGroups) {
        self.groups.insert(cluster_id.to_string(), groups);
    }

    /// Store a pre-existing object, as if created out of band
    pub fn seed<K: Serialize>(&self, cluster_id: &str, kind: FederatedKind, object: &K) -> DynamicObject {
        let mut object = to_dynamic(object).expect("serializable seed");
        object.metadata.uid = Some(self.uid());
        object.metadata.resource_version = Some("1".to_string());
        let key = (
            cluster_id.to_string(),
            kind,
            object.metadata.namespace.clone(),
            object.metadata.name.clone().expect("seed needs a name"),
        );
        self.objects.insert(key, object.clone());
        object
    }

    pub fn get<K: DeserializeOwned>(
        &self,
        cluster_id: &str,
        kind: FederatedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<K> {
        let key = (
            cluster_id.to_string(),
            kind,
            namespace.map(str::to_string),
            name.to_string(),
        );
        self.objects
            .get(&key)
            .map(|o| from_dynamic(o.value().clone()).expect("typed object"))
    }

    pub fn remove(&self, cluster_id: &str, kind: FederatedKind, namespace: Option<&str>, name: &str) {
        self.objects.remove(&(
            cluster_id.to_string(),
            kind,
            namespace.map(str::to_string),
            name.to_string(),
        ));
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn uid(&self) -> String {
        format!("uid-{}", self.next_uid.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_reachable(&self, cluster: &Cluster) -> Result<()> {
        if self.unreachable.contains(&cluster.id) {
            return Err(Error::transient(cluster.name.clone(), "connection refused").into());
        }
        Ok(())
    }

    fn key(cluster: &Cluster, target: &ResourceTarget, name: &str) -> ObjectKey {
        let namespace = if target.kind.is_namespaced() {
            target.namespace.clone()
        } else {
            None
        };
        (cluster.id.clone(), target.kind, namespace, name.to_string())
    }

    fn name_of(object: &DynamicObject) -> Result<String> {
        object
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation_for_field("object", "metadata.name", "required").into())
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn fetch(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        lookup: &ResourceLookup,
    ) -> Result<Option<DynamicObject>> {
        self.check_reachable(cluster)?;
        Ok(match lookup {
            ResourceLookup::Name(name) => self
                .objects
                .get(&Self::key(cluster, target, name))
                .map(|o| o.value().clone()),
            ResourceLookup::Id(uid) => self
                .objects
                .iter()
                .find(|entry| {
                    let (cluster_id, kind, namespace, _) = entry.key();
                    cluster_id == &cluster.id
                        && *kind == target.kind
                        && (target.namespace.is_none() || namespace == &target.namespace)
                        && entry.value().metadata.uid.as_deref() == Some(uid.as_str())
                })
                .map(|entry| entry.value().clone()),
        })
    }

    async fn create(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        mut object: DynamicObject,
    ) -> Result<DynamicObject> {
        self.check_reachable(cluster)?;
        let name = Self::name_of(&object)?;
        let key = Self::key(cluster, target, &name);
        if self.objects.contains_key(&key) {
            return Err(Error::conflict(target.kind.resource_kind(), name, "already exists").into());
        }
        object.metadata.uid = Some(self.uid());
        object.metadata.resource_version = Some("1".to_string());
        object.metadata.namespace = key.2.clone();
        if target.kind == FederatedKind::Namespace {
            let phase = if self.namespaces_pending.load(Ordering::SeqCst) {
                "Pending"
            } else {
                "Active"
            };
            object.data["status"] = json!({ "phase": phase });
        }
        self.objects.insert(key, object.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }

    async fn update(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        mut object: DynamicObject,
    ) -> Result<DynamicObject> {
        self.check_reachable(cluster)?;
        let name = Self::name_of(&object)?;
        let key = Self::key(cluster, target, &name);
        let mut current = self
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(target.kind.resource_kind(), name.clone()))?;
        let version: u64 = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        object.metadata.uid = current.metadata.uid.clone();
        object.metadata.resource_version = Some((version + 1).to_string());
        *current = object.clone();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }

    async fn delete(&self, cluster: &Cluster, target: &ResourceTarget, name: &str) -> Result<()> {
        self.check_reachable(cluster)?;
        if self.objects.remove(&Self::key(cluster, target, name)).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn api_resources(&self, cluster: &Cluster) -> Result<ApiGroupResources> {
        self.check_reachable(cluster)?;
        Ok(self
            .api_resources
            .get(&cluster.id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn cluster_users(&self, cluster: &Cluster) -> Result<ClusterUsers> {
        self.check_reachable(cluster)?;
        Ok(self
            .users
            .get(&cluster.id)
            .map(|u| u.value().clone())
            .unwrap_or_default())
    }

    async fn cluster_user_groups(&self, cluster: &Cluster) -> Result<ClusterUserGroups> {
        self.check_reachable(cluster)?;
        Ok(self
            .groups
            .get(&cluster.id)
            .map(|g| g.value().clone())
            .unwrap_or_default())
    }
}

pub fn cluster(id: &str, name: &str) -> Cluster {
    Cluster::running(id, name, DOMAIN)
}

pub fn rule(verbs: &[&str], resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// ClusterRole template named "viewer"
pub fn viewer(rules: Vec<PolicyRule>) -> FederatedTemplate<FederatedClusterRoleSpec> {
    FederatedTemplate::new(
        "viewer",
        DOMAIN,
        FederatedClusterRoleSpec {
            template: ClusterRoleTemplate {
                rules,
                aggregation_rule: None,
            },
        },
    )
}

pub fn namespace_template(name: &str) -> FederatedTemplate<FederatedNamespaceSpec> {
    FederatedTemplate::new(name, DOMAIN, FederatedNamespaceSpec::default())
}

/// A federation over in-memory stores and a fake cluster client
pub struct Harness {
    pub federation: Federation,
    pub stores: FederationStores,
    pub client: Arc<FakeClusterClient>,
    pub clusters: Arc<InMemoryClusterDirectory>,
    pub audit: Arc<RecordingAuditSink>,
}

impl Harness {
    pub fn config() -> FederationConfig {
        FederationConfig {
            lock_timeout: Duration::from_secs(1),
            namespace_ready_timeout: Duration::from_millis(500),
            namespace_poll_interval: Duration::from_millis(10),
            ..FederationConfig::default()
        }
    }

    pub fn new(clusters: &[Cluster]) -> Self {
        Self::with_config(Self::config(), clusters)
    }

    pub fn with_config(config: FederationConfig, clusters: &[Cluster]) -> Self {
        let directory = Arc::new(InMemoryClusterDirectory::new());
        for c in clusters {
            directory.upsert(c.clone());
        }
        let client = Arc::new(FakeClusterClient::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let ctx = Arc::new(
            FederationContext::builder(directory.clone())
                .cluster_client(client.clone())
                .lock_manager(Arc::new(KeyedLockManager::new(config.lock_timeout)))
                .audit_sink(audit.clone())
                .config(config)
                .build(),
        );
        let stores = FederationStores::in_memory();
        let federation = Federation::new(ctx, stores.clone()).expect("federation wiring");
        Self {
            federation,
            stores,
            client,
            clusters: directory,
            audit,
        }
    }
}
