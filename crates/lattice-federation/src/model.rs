//! Federation data model: templates, join records, clusters and query scope

use std::fmt;

use chrono::{DateTime, Utc};
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use lattice_common::kube_utils::build_api_resource;
use lattice_common::Error;

const RBAC_API_VERSION: &str = "rbac.authorization.k8s.io/v1";

/// Federated resource kinds, one per projector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FederatedKind {
    /// Namespace (cluster-scoped)
    Namespace,
    /// ClusterRole (cluster-scoped)
    ClusterRole,
    /// ClusterRoleBinding (cluster-scoped)
    ClusterRoleBinding,
    /// Role (lives in a federated namespace)
    Role,
    /// RoleBinding (lives in a federated namespace)
    RoleBinding,
}

/// Where a projected resource lives inside a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    /// Cluster-wide object
    Cluster,
    /// Object inside a namespace resolved from the federated namespace
    Namespaced,
}

impl FederatedKind {
    /// Every kind, cluster-scoped first
    pub const ALL: [FederatedKind; 5] = [
        FederatedKind::Namespace,
        FederatedKind::ClusterRole,
        FederatedKind::ClusterRoleBinding,
        FederatedKind::Role,
        FederatedKind::RoleBinding,
    ];

    /// Keyword of the federated template (e.g. "federatedclusterrole")
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Namespace => "federatednamespace",
            Self::ClusterRole => "federatedclusterrole",
            Self::ClusterRoleBinding => "federatedclusterrolebinding",
            Self::Role => "federatedrole",
            Self::RoleBinding => "federatedrolebinding",
        }
    }

    /// Kubernetes kind of the projected resource
    pub fn resource_kind(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
        }
    }

    /// apiVersion of the projected resource
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Namespace => "v1",
            _ => RBAC_API_VERSION,
        }
    }

    /// Cluster-wide or namespaced
    pub fn scope(&self) -> ResourceScope {
        match self {
            Self::Role | Self::RoleBinding => ResourceScope::Namespaced,
            _ => ResourceScope::Cluster,
        }
    }

    /// Shorthand for `scope() == ResourceScope::Namespaced`
    pub fn is_namespaced(&self) -> bool {
        self.scope() == ResourceScope::Namespaced
    }

    /// `ApiResource` for dynamic access to the projected resource
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(self.api_version(), self.resource_kind())
    }
}

impl fmt::Display for FederatedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Lifecycle status of a federated template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    /// Converged (or never synced with failures)
    #[default]
    Active,
    /// A sync task is running
    Syncing,
    /// Last sync failed on at least one cluster
    SyncFail,
    /// Last update could not be pushed to every cluster
    UpdateFail,
}

impl fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Syncing => "syncing",
            Self::SyncFail => "sync_fail",
            Self::UpdateFail => "update_fail",
        };
        f.write_str(s)
    }
}

/// Identity and lifecycle of a federated template, shared by all kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    /// Template id
    pub id: String,
    /// Template name; becomes the name of every projected resource
    pub name: String,
    /// Owning domain
    pub domain_id: String,
    /// Lifecycle status
    pub status: TemplateStatus,
    /// Federated namespace the template lives in (namespaced kinds only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_namespace_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A federated template: identity plus kind-specific spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedTemplate<S> {
    /// Identity and status
    pub meta: TemplateMeta,
    /// Kind-specific payload
    pub spec: S,
}

impl<S> FederatedTemplate<S> {
    /// New active template with a fresh id
    pub fn new(name: impl Into<String>, domain_id: impl Into<String>, spec: S) -> Self {
        Self {
            meta: TemplateMeta {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.into(),
                domain_id: domain_id.into(),
                status: TemplateStatus::Active,
                federated_namespace_id: None,
                created_at: Utc::now(),
            },
            spec,
        }
    }

    /// Place the template inside a federated namespace
    pub fn in_namespace(mut self, federated_namespace_id: impl Into<String>) -> Self {
        self.meta.federated_namespace_id = Some(federated_namespace_id.into());
        self
    }

    /// Template id
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Template name
    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

/// Per-(template, cluster) projection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRecord {
    /// Record id
    pub id: String,
    /// Kind of the owning template
    pub kind: FederatedKind,
    /// Owning template
    pub federated_template_id: String,
    /// Target cluster
    pub cluster_id: String,
    /// uid of the projected resource; unset until the first successful reconcile
    pub resource_id: Option<String>,
    /// uid of the cluster-local namespace (namespaced kinds)
    pub namespace_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl JoinRecord {
    /// New unprovisioned record
    pub fn new(
        kind: FederatedKind,
        federated_template_id: impl Into<String>,
        cluster_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            federated_template_id: federated_template_id.into(),
            cluster_id: cluster_id.into(),
            resource_id: None,
            namespace_id: None,
            created_at: Utc::now(),
        }
    }

    /// True once the remote resource has been created or adopted
    pub fn is_provisioned(&self) -> bool {
        self.resource_id.is_some()
    }
}

/// Running state of a member cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Being provisioned
    Pending,
    /// Reachable and serving
    Running,
    /// Known but not reachable
    Unreachable,
    /// Being torn down
    Deleting,
}

/// A member cluster. Read-only to federation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Cluster id
    pub id: String,
    /// Cluster name
    pub name: String,
    /// Owning domain
    pub domain_id: String,
    /// Running state
    pub status: ClusterStatus,
    /// Admin kubeconfig used to reach the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

impl Cluster {
    /// Running cluster without a kubeconfig (tests and fakes)
    pub fn running(
        id: impl Into<String>,
        name: impl Into<String>,
        domain_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain_id: domain_id.into(),
            status: ClusterStatus::Running,
            kubeconfig: None,
        }
    }

    /// True when the cluster can be targeted
    pub fn is_running(&self) -> bool {
        self.status == ClusterStatus::Running
    }
}

/// Caller-supplied cluster reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClusterRef {
    /// By id
    Id(String),
    /// By name
    Name(String),
}

impl ClusterRef {
    /// Reference by id
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    /// Reference by name
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id={}", id),
            Self::Name(name) => write!(f, "name={}", name),
        }
    }
}

/// Visibility of a read-only cross-cluster query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Only clusters owned by the domain
    Domain(String),
    /// Every cluster
    System,
}

impl QueryScope {
    /// Build a scope from a request's scope name
    ///
    /// `cross_domain_scope_name` comes from configuration; any other name keeps
    /// the query inside the caller's domain.
    pub fn from_request(
        scope_name: Option<&str>,
        domain_id: impl Into<String>,
        cross_domain_scope_name: &str,
    ) -> Self {
        match scope_name {
            Some(name) if name == cross_domain_scope_name => Self::System,
            _ => Self::Domain(domain_id.into()),
        }
    }

    /// True if the cluster is visible in this scope
    pub fn includes(&self, cluster: &Cluster) -> bool {
        match self {
            Self::System => true,
            Self::Domain(domain) => &cluster.domain_id == domain,
        }
    }
}

/// Check a template name is usable as the projected object's name
///
/// Namespaces must be RFC 1123 labels. RBAC objects only need a valid path
/// segment, so names like `system:viewer` are allowed.
pub fn validate_resource_name(kind: FederatedKind, name: &str) -> Result<(), Error> {
    let valid = match kind {
        FederatedKind::Namespace => is_dns1123_label(name),
        _ => is_path_segment(name),
    };
    if !valid {
        return Err(Error::validation_for_field(
            kind.keyword(),
            "metadata.name",
            format!("{:?} is not a valid {} name", name, kind.resource_kind()),
        ));
    }
    Ok(())
}

fn is_dns1123_label(name: &str) -> bool {
    let edges = name
        .chars()
        .next()
        .zip(name.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);
    edges
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '%'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_describe_their_projection() {
        assert_eq!(FederatedKind::ClusterRole.keyword(), "federatedclusterrole");
        assert_eq!(FederatedKind::Namespace.api_version(), "v1");
        assert!(FederatedKind::RoleBinding.is_namespaced());
        assert!(!FederatedKind::ClusterRoleBinding.is_namespaced());

        let ar = FederatedKind::Role.api_resource();
        assert_eq!(ar.group, "rbac.authorization.k8s.io");
        assert_eq!(ar.plural, "roles");
    }

    #[test]
    fn new_join_record_is_unprovisioned() {
        let record = JoinRecord::new(FederatedKind::ClusterRole, "tpl", "cluster-a");
        assert!(!record.is_provisioned());
        assert_eq!(record.federated_template_id, "tpl");
    }

    #[test]
    fn query_scope_filters_by_domain_unless_system() {
        let ours = Cluster::running("c1", "a", "dom-1");
        let theirs = Cluster::running("c2", "b", "dom-2");

        let scoped = QueryScope::from_request(None, "dom-1", "system");
        assert!(scoped.includes(&ours));
        assert!(!scoped.includes(&theirs));

        let system = QueryScope::from_request(Some("system"), "dom-1", "system");
        assert_eq!(system, QueryScope::System);
        assert!(system.includes(&theirs));
    }

    #[test]
    fn template_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TemplateStatus::UpdateFail).unwrap(),
            "\"update_fail\""
        );
        assert_eq!(TemplateStatus::SyncFail.to_string(), "sync_fail");
    }

    #[test]
    fn rbac_names_only_need_a_path_segment() {
        for name in ["viewer", "system:viewer", "Viewer", "system.viewer", "-viewer"] {
            assert!(validate_resource_name(FederatedKind::ClusterRole, name).is_ok(), "{name}");
            assert!(validate_resource_name(FederatedKind::RoleBinding, name).is_ok(), "{name}");
        }
        for name in ["", ".", "..", "a/b", "50%"] {
            assert!(validate_resource_name(FederatedKind::ClusterRole, name).is_err(), "{name}");
        }
    }

    #[test]
    fn namespace_names_are_dns_labels() {
        assert!(validate_resource_name(FederatedKind::Namespace, "team-a").is_ok());
        for name in ["team.a", "Team", "-team", "team-", "", "system:team"] {
            assert!(validate_resource_name(FederatedKind::Namespace, name).is_err(), "{name}");
        }
        let long = "a".repeat(64);
        assert!(validate_resource_name(FederatedKind::Namespace, &long).is_err());
    }
}
