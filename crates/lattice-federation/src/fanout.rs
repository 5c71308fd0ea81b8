//! Parallel read-only queries across member clusters
//!
//! [`FanoutAggregator::aggregate`] runs one query per running cluster in
//! scope, concurrently. The first failure cancels the rest. Non-empty
//! results are unioned into one set.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cluster_client::ClusterClient;
use crate::cluster_directory::ClusterDirectory;
use crate::error::{OperationContext, ResultExt};
use crate::model::{Cluster, FederatedKind, QueryScope};
use crate::Result;

/// A mergeable collection of remote resources
pub trait RemoteResourceSet: Default + Send + 'static {
    /// No elements
    fn is_empty(&self) -> bool;
    /// Elements in either set
    fn union(self, other: Self) -> Self;
    /// Elements in both sets
    fn intersection(self, other: Self) -> Self;
}

/// Element of a [`KeyedSet`]
pub trait SetKey {
    /// Identity used for union and intersection
    fn set_key(&self) -> String;
}

/// Set of items identified by [`SetKey`]; later inserts win on duplicate keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedSet<T> {
    items: BTreeMap<String, T>,
}

impl<T> Default for KeyedSet<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T: SetKey> KeyedSet<T> {
    /// Add an item
    pub fn insert(&mut self, item: T) {
        self.items.insert(item.set_key(), item);
    }

    /// True if an item with `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Items in key order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }
}

impl<T: SetKey> FromIterator<T> for KeyedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::default();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

impl<T: SetKey + Send + 'static> RemoteResourceSet for KeyedSet<T> {
    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn union(mut self, other: Self) -> Self {
        self.items.extend(other.items);
        self
    }

    fn intersection(mut self, other: Self) -> Self {
        self.items.retain(|k, _| other.items.contains_key(k));
        self
    }
}

/// An API resource served by a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiGroupResource {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl SetKey for ApiGroupResource {
    fn set_key(&self) -> String {
        format!("{}/{}", self.group, self.resource)
    }
}

/// A user known to a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUser {
    pub name: String,
    pub full_name: String,
    /// Identity provider mappings
    pub identities: Vec<String>,
    pub groups: Vec<String>,
}

impl SetKey for ClusterUser {
    fn set_key(&self) -> String {
        format!("{}/{}", self.name, self.full_name)
    }
}

/// A user group known to a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUserGroup {
    pub name: String,
    pub users: Vec<String>,
}

impl SetKey for ClusterUserGroup {
    fn set_key(&self) -> String {
        self.name.clone()
    }
}

/// API resources keyed by `group/resource`
pub type ApiGroupResources = KeyedSet<ApiGroupResource>;
/// Users keyed by `name/fullName`
pub type ClusterUsers = KeyedSet<ClusterUser>;
/// Groups keyed by `name`
pub type ClusterUserGroups = KeyedSet<ClusterUserGroup>;

/// Union of every non-empty result
pub fn union_all<S: RemoteResourceSet>(results: impl IntoIterator<Item = S>) -> S {
    results
        .into_iter()
        .filter(|s| !s.is_empty())
        .fold(S::default(), S::union)
}

/// Runs a per-cluster query across running clusters and merges the results
pub struct FanoutAggregator {
    clusters: Arc<dyn ClusterDirectory>,
    client: Arc<dyn ClusterClient>,
}

impl FanoutAggregator {
    /// Aggregator over `clusters`, querying through `client`
    pub fn new(clusters: Arc<dyn ClusterDirectory>, client: Arc<dyn ClusterClient>) -> Self {
        Self { clusters, client }
    }

    /// Run `per_cluster` on every running cluster in `scope` and union the results
    ///
    /// `Ok(None)` and empty results are skipped. The first error cancels the
    /// other in-flight queries and is returned.
    pub async fn aggregate<S, F, Fut>(&self, scope: &QueryScope, per_cluster: F) -> Result<S>
    where
        S: RemoteResourceSet,
        F: Fn(Cluster) -> Fut,
        Fut: Future<Output = Result<Option<S>>>,
    {
        let clusters = self.clusters.list_running(scope).await?;
        debug!(clusters = clusters.len(), "fan-out query");
        let results = try_join_all(clusters.into_iter().map(&per_cluster)).await?;
        Ok(union_all(results.into_iter().flatten()))
    }

    /// API resources served by the running clusters in `scope`
    #[instrument(skip(self))]
    pub async fn api_resources(&self, scope: &QueryScope) -> Result<ApiGroupResources> {
        self.aggregate(scope, |cluster| {
            let client = self.client.clone();
            async move {
                let id = cluster.id.clone();
                client
                    .api_resources(&cluster)
                    .await
                    .map(Some)
                    .with_context(|| query_context("api-resources", id))
            }
        })
        .await
    }

    /// Users known to the running clusters in `scope`
    #[instrument(skip(self))]
    pub async fn cluster_users(&self, scope: &QueryScope) -> Result<ClusterUsers> {
        self.aggregate(scope, |cluster| {
            let client = self.client.clone();
            async move {
                let id = cluster.id.clone();
                client
                    .cluster_users(&cluster)
                    .await
                    .map(Some)
                    .with_context(|| query_context("cluster-users", id))
            }
        })
        .await
    }

    /// User groups known to the running clusters in `scope`
    #[instrument(skip(self))]
    pub async fn cluster_user_groups(&self, scope: &QueryScope) -> Result<ClusterUserGroups> {
        self.aggregate(scope, |cluster| {
            let client = self.client.clone();
            async move {
                let id = cluster.id.clone();
                client
                    .cluster_user_groups(&cluster)
                    .await
                    .map(Some)
                    .with_context(|| query_context("cluster-user-groups", id))
            }
        })
        .await
    }
}

fn query_context(operation: &'static str, cluster_id: String) -> OperationContext {
    OperationContext::new(operation, FederatedKind::Namespace, "-").cluster(cluster_id)
}
