//! Cluster identity resolution
//!
//! Clusters are owned by cluster lifecycle management; federation only reads
//! them through [`ClusterDirectory`].

use async_trait::async_trait;
use dashmap::DashMap;

#[cfg(test)]
use mockall::automock;

use lattice_common::Error;

use crate::model::{Cluster, ClusterRef, QueryScope};
use crate::Result;

/// Read-only view of member clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Resolve an id or name to a cluster; `NotFound` if unknown
    async fn resolve(&self, cluster: &ClusterRef) -> Result<Cluster>;

    /// Running clusters visible in `scope`, ordered by name
    async fn list_running(&self, scope: &QueryScope) -> Result<Vec<Cluster>>;
}

/// In-memory [`ClusterDirectory`]
#[derive(Default)]
pub struct InMemoryClusterDirectory {
    clusters: DashMap<String, Cluster>,
}

impl InMemoryClusterDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a cluster
    pub fn upsert(&self, cluster: Cluster) {
        self.clusters.insert(cluster.id.clone(), cluster);
    }

    /// Forget a cluster
    pub fn remove(&self, cluster_id: &str) -> Option<Cluster> {
        self.clusters.remove(cluster_id).map(|(_, c)| c)
    }
}

#[async_trait]
impl ClusterDirectory for InMemoryClusterDirectory {
    async fn resolve(&self, cluster: &ClusterRef) -> Result<Cluster> {
        let found = match cluster {
            ClusterRef::Id(id) => self.clusters.get(id).map(|c| c.value().clone()),
            ClusterRef::Name(name) => self
                .clusters
                .iter()
                .find(|c| &c.name == name)
                .map(|c| c.value().clone()),
        };
        found.ok_or_else(|| Error::not_found("cluster", cluster.to_string()).into())
    }

    async fn list_running(&self, scope: &QueryScope) -> Result<Vec<Cluster>> {
        let mut clusters: Vec<Cluster> = self
            .clusters
            .iter()
            .filter(|c| c.is_running() && scope.includes(c))
            .map(|c| c.value().clone())
            .collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClusterStatus;
    use lattice_common::ErrorKind;

    fn directory() -> InMemoryClusterDirectory {
        let dir = InMemoryClusterDirectory::new();
        dir.upsert(Cluster::running("c1", "alpha", "dom-1"));
        dir.upsert(Cluster::running("c2", "beta", "dom-2"));
        dir.upsert(Cluster {
            status: ClusterStatus::Unreachable,
            ..Cluster::running("c3", "gamma", "dom-1")
        });
        dir
    }

    #[tokio::test]
    async fn resolves_by_id_and_name() {
        let dir = directory();
        assert_eq!(dir.resolve(&ClusterRef::id("c1")).await.unwrap().name, "alpha");
        assert_eq!(dir.resolve(&ClusterRef::name("beta")).await.unwrap().id, "c2");
        let err = dir.resolve(&ClusterRef::name("delta")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_running_skips_unreachable_and_other_domains() {
        let dir = directory();
        let scoped = dir
            .list_running(&QueryScope::Domain("dom-1".to_string()))
            .await
            .unwrap();
        assert_eq!(scoped.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["alpha"]);

        let all = dir.list_running(&QueryScope::System).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
