//! Multi-cluster federation engine
//!
//! Federated templates (namespaces, cluster roles and bindings, roles and
//! role bindings) are attached to member clusters and reconciled onto them:
//! - One [`ReconciliationEngine`] per kind, statically typed by its projector
//! - Join records track each (template, cluster) pair and the projected resource id
//! - Namespaced kinds resolve their cluster namespace through the federated namespace
//! - [`FanoutAggregator`] runs read-only queries across running clusters

pub mod cluster_client;
pub mod cluster_directory;
pub mod context;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod kinds;
pub mod lock;
pub mod model;
pub mod namespace;
pub mod registry;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use context::{ContextBuilder, FederationContext, PostCreateHook};
pub use engine::{BindStatus, JoinDetails, ReconciliationEngine};
pub use error::{FederationError, OperationContext};
pub use fanout::FanoutAggregator;
pub use model::{Cluster, ClusterRef, FederatedKind, FederatedTemplate, JoinRecord, QueryScope};
pub use registry::{Federation, FederationDirectory, FederationStores, JoinManager};

/// Result type alias using the federation error
pub type Result<T> = std::result::Result<T, FederationError>;
