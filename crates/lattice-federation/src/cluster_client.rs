//! Access to projected resources inside member clusters
//!
//! [`ClusterClient`] is the capability the engine uses to fetch, create,
//! update and delete per-cluster objects. [`KubeClusterClient`] implements it
//! over `kube::Api<DynamicObject>`, with one cached `kube::Client` per
//! cluster supplied by a [`ClusterConnector`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use lattice_common::kube_utils::{
    build_api_resource, create_client_from_kubeconfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_READ_TIMEOUT,
};
use lattice_common::Error;

use crate::fanout::{
    ApiGroupResource, ApiGroupResources, ClusterUser, ClusterUserGroup, ClusterUserGroups,
    ClusterUsers,
};
use crate::model::{Cluster, FederatedKind};
use crate::Result;

/// Kind and namespace of a per-cluster object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTarget {
    /// Federated kind being projected
    pub kind: FederatedKind,
    /// Cluster-local namespace; `None` for cluster-scoped kinds, or to search
    /// every namespace when fetching by id
    pub namespace: Option<String>,
}

impl ResourceTarget {
    /// Cluster-scoped target
    pub fn cluster_scoped(kind: FederatedKind) -> Self {
        Self {
            kind,
            namespace: None,
        }
    }

    /// Namespaced target
    pub fn namespaced(kind: FederatedKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
        }
    }
}

/// How to find an existing object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLookup {
    /// By `metadata.uid`
    Id(String),
    /// By `metadata.name`
    Name(String),
}

/// Remote cluster resource capability
///
/// `fetch` returns `Ok(None)` for "not present"; errors are transport or
/// API failures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Find an object by uid or name
    async fn fetch(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        lookup: &ResourceLookup,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object; the returned object carries its uid
    async fn create(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        object: DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace an existing object
    async fn update(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        object: DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object by name; absent objects are not an error
    async fn delete(&self, cluster: &Cluster, target: &ResourceTarget, name: &str) -> Result<()>;

    /// API resources the cluster serves
    async fn api_resources(&self, cluster: &Cluster) -> Result<ApiGroupResources>;

    /// Users registered in the cluster; empty if it has no user API
    async fn cluster_users(&self, cluster: &Cluster) -> Result<ClusterUsers>;

    /// User groups registered in the cluster; empty if it has no user API
    async fn cluster_user_groups(&self, cluster: &Cluster) -> Result<ClusterUserGroups>;
}

const USER_API_VERSION: &str = "user.openshift.io/v1";

fn string_list(object: &DynamicObject, field: &str) -> Vec<String> {
    object
        .data
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Read a `user.openshift.io/v1` User
pub fn user_from_object(object: &DynamicObject) -> Option<ClusterUser> {
    Some(ClusterUser {
        name: object.metadata.name.clone()?,
        full_name: object
            .data
            .get("fullName")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        identities: string_list(object, "identities"),
        groups: string_list(object, "groups"),
    })
}

/// Read a `user.openshift.io/v1` Group
pub fn group_from_object(object: &DynamicObject) -> Option<ClusterUserGroup> {
    Some(ClusterUserGroup {
        name: object.metadata.name.clone()?,
        users: string_list(object, "users"),
    })
}

/// Serialize a typed object into a `DynamicObject`
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Deserialize a `DynamicObject` into a typed object
pub fn from_dynamic<K: DeserializeOwned>(object: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// uid of an object returned by the API server
pub fn resource_uid(object: &DynamicObject) -> Result<String> {
    object.metadata.uid.clone().ok_or_else(|| {
        Error::internal_with_context(
            "cluster-client",
            format!(
                "object {} has no uid",
                object.metadata.name.as_deref().unwrap_or("<unnamed>")
            ),
        )
        .into()
    })
}

/// Yields a `kube::Client` for a member cluster
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Client for `cluster`
    async fn client_for(&self, cluster: &Cluster) -> Result<Client>;

    /// Drop any cached client (cluster credentials rotated or cluster removed)
    fn forget(&self, cluster_id: &str);
}

/// Builds clients from each cluster's kubeconfig and caches them by cluster id
pub struct KubeconfigConnector {
    clients: DashMap<String, Client>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for KubeconfigConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

impl KubeconfigConnector {
    /// Connector with custom timeouts
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl ClusterConnector for KubeconfigConnector {
    async fn client_for(&self, cluster: &Cluster) -> Result<Client> {
        if let Some(client) = self.clients.get(&cluster.id) {
            return Ok(client.value().clone());
        }
        let kubeconfig = cluster.kubeconfig.as_deref().ok_or_else(|| {
            Error::precondition("cluster", cluster.name.clone(), "no kubeconfig registered")
        })?;
        let client =
            create_client_from_kubeconfig(kubeconfig, self.connect_timeout, self.read_timeout)
                .await?;
        debug!(cluster = %cluster.name, "connected to member cluster");
        self.clients.insert(cluster.id.clone(), client.clone());
        Ok(client)
    }

    fn forget(&self, cluster_id: &str) {
        self.clients.remove(cluster_id);
    }
}

/// [`ClusterClient`] over the Kubernetes API
pub struct KubeClusterClient {
    connector: Arc<dyn ClusterConnector>,
    field_manager: String,
}

impl KubeClusterClient {
    /// Client writing with `field_manager`
    pub fn new(connector: Arc<dyn ClusterConnector>, field_manager: impl Into<String>) -> Self {
        Self {
            connector,
            field_manager: field_manager.into(),
        }
    }

    async fn api(&self, cluster: &Cluster, target: &ResourceTarget) -> Result<Api<DynamicObject>> {
        let client = self.connector.client_for(cluster).await?;
        let ar = target.kind.api_resource();
        Ok(match &target.namespace {
            Some(ns) if target.kind.is_namespaced() => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        })
    }

    /// List a kind of the cluster's user API; clusters without it list nothing
    async fn list_user_api(&self, cluster: &Cluster, kind: &str) -> Result<Vec<DynamicObject>> {
        let client = self.connector.client_for(cluster).await?;
        let api: Api<DynamicObject> =
            Api::all_with(client, &build_api_resource(USER_API_VERSION, kind));
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(cluster = %cluster.name, kind, "no user API served");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn object_name(object: &DynamicObject) -> Result<String> {
    object
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::validation_for_field("object", "metadata.name", "name is required").into())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn fetch(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        lookup: &ResourceLookup,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(cluster, target).await?;
        match lookup {
            ResourceLookup::Name(name) => Ok(api.get_opt(name).await?),
            ResourceLookup::Id(uid) => {
                let list = api.list(&ListParams::default()).await?;
                trace!(cluster = %cluster.name, candidates = list.items.len(), "fetch by uid");
                Ok(list
                    .items
                    .into_iter()
                    .find(|o| o.metadata.uid.as_deref() == Some(uid.as_str())))
            }
        }
    }

    async fn create(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.api(cluster, target).await?;
        Ok(api.create(&self.post_params(), &object).await?)
    }

    async fn update(
        &self,
        cluster: &Cluster,
        target: &ResourceTarget,
        object: DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object_name(&object)?;
        let api = self.api(cluster, target).await?;
        Ok(api.replace(&name, &self.post_params(), &object).await?)
    }

    async fn delete(&self, cluster: &Cluster, target: &ResourceTarget, name: &str) -> Result<()> {
        let api = self.api(cluster, target).await?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn api_resources(&self, cluster: &Cluster) -> Result<ApiGroupResources> {
        let client = self.connector.client_for(cluster).await?;
        let discovery = Discovery::new(client).run().await?;
        let mut resources = ApiGroupResources::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                resources.insert(ApiGroupResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    resource: ar.plural.clone(),
                    kind: ar.kind.clone(),
                    namespaced: caps.scope == Scope::Namespaced,
                    verbs: caps.operations.clone(),
                });
            }
        }
        Ok(resources)
    }

    async fn cluster_users(&self, cluster: &Cluster) -> Result<ClusterUsers> {
        let objects = self.list_user_api(cluster, "User").await?;
        Ok(objects.iter().filter_map(user_from_object).collect())
    }

    async fn cluster_user_groups(&self, cluster: &Cluster) -> Result<ClusterUserGroups> {
        let objects = self.list_user_api(cluster, "Group").await?;
        Ok(objects.iter().filter_map(group_from_object).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use lattice_common::ErrorKind;

    #[test]
    fn typed_objects_round_trip_through_dynamic() {
        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some("viewer".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: vec!["get".to_string()],
                ..Default::default()
            }]),
            aggregation_rule: None,
        };
        let dynamic = to_dynamic(&role).unwrap();
        assert_eq!(dynamic.types.as_ref().map(|t| t.kind.as_str()), Some("ClusterRole"));
        assert_eq!(resource_uid(&dynamic).unwrap(), "uid-1");

        let back: ClusterRole = from_dynamic(dynamic).unwrap();
        assert_eq!(back, role);
    }

    #[test]
    fn missing_uid_is_internal() {
        let object = DynamicObject::new("viewer", &FederatedKind::ClusterRole.api_resource());
        assert_eq!(resource_uid(&object).unwrap_err().kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn connector_needs_a_kubeconfig() {
        let connector = KubeconfigConnector::default();
        let cluster = Cluster::running("c1", "alpha", "dom");
        let err = connector.client_for(&cluster).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn openshift_users_and_groups_are_read() {
        let ar = build_api_resource(USER_API_VERSION, "User");
        assert_eq!(ar.plural, "users");
        let alice = DynamicObject::new("alice", &ar).data(serde_json::json!({
            "fullName": "Alice Liddell",
            "identities": ["ldap:alice"],
            "groups": null,
        }));
        let user = user_from_object(&alice).unwrap();
        assert_eq!(user.full_name, "Alice Liddell");
        assert_eq!(user.identities, vec!["ldap:alice"]);
        assert!(user.groups.is_empty());

        let devs = DynamicObject::new("devs", &build_api_resource(USER_API_VERSION, "Group"))
            .data(serde_json::json!({ "users": ["alice", "bob"] }));
        let group = group_from_object(&devs).unwrap();
        assert_eq!(group.name, "devs");
        assert_eq!(group.users, vec!["alice", "bob"]);
    }
}
