//! Federated kinds and their projectors
//!
//! Each kind pairs a typed template spec with the `k8s-openapi` object it
//! projects onto member clusters. The engine is generic over
//! [`ResourceProjector`], so every kind gets a statically typed instance.

mod cluster_role;
mod cluster_role_binding;
mod namespace;
mod role;
mod role_binding;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use lattice_common::Error;

use crate::model::{Cluster, FederatedKind, FederatedTemplate, TemplateMeta};
use crate::store::TemplateStore;
use crate::Result;

pub use cluster_role::{ClusterRoleProjector, ClusterRoleTemplate, FederatedClusterRoleSpec};
pub use cluster_role_binding::{
    ClusterRoleBindingProjector, ClusterRoleBindingTemplate, FederatedClusterRoleBindingSpec,
};
pub use namespace::{namespace_is_active, FederatedNamespaceSpec, NamespaceProjector, NamespaceTemplate};
pub use role::{FederatedRoleSpec, RoleProjector, RoleTemplate};
pub use role_binding::{FederatedRoleBindingSpec, RoleBindingProjector, RoleBindingTemplate};

/// Label carrying the id of the template a resource was projected from
pub const TEMPLATE_ID_LABEL: &str = "federation.lattice.dev/template-id";
/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of the managed-by label on projected resources
pub const MANAGED_BY_VALUE: &str = "lattice-federation";

/// Where a projected resource is being created
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    /// Target cluster
    pub cluster: &'a Cluster,
    /// Cluster-local namespace (namespaced kinds)
    pub namespace: Option<&'a str>,
}

/// Converts a federated template into the per-cluster object
#[async_trait]
pub trait ResourceProjector: Send + Sync + 'static {
    /// Template payload
    type Spec: Clone + std::fmt::Debug + Send + Sync + 'static;
    /// Projected Kubernetes object
    type Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    /// Kind tag
    const KIND: FederatedKind;

    /// Object to create in a cluster that does not have it yet
    fn build_create(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        placement: &Placement<'_>,
    ) -> Result<Self::Resource>;

    /// `existing` brought in line with the template; server-owned fields are kept
    fn build_update(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        existing: Self::Resource,
    ) -> Result<Self::Resource>;

    /// Checks run before a template is stored
    async fn validate_create(&self, _template: &FederatedTemplate<Self::Spec>) -> Result<()> {
        Ok(())
    }

    /// Kind-specific checks on a template update. Name immutability is
    /// enforced by the engine for every kind.
    fn validate_update(
        &self,
        _old: &FederatedTemplate<Self::Spec>,
        _new: &FederatedTemplate<Self::Spec>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Metadata for a newly projected object
pub(crate) fn projected_meta(meta: &TemplateMeta, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(meta.name.clone()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([
            (TEMPLATE_ID_LABEL.to_string(), meta.id.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])),
        ..Default::default()
    }
}

/// Existing metadata with the federation labels (re)applied
pub(crate) fn refreshed_meta(mut existing: ObjectMeta, meta: &TemplateMeta) -> ObjectMeta {
    let labels = existing.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(TEMPLATE_ID_LABEL.to_string(), meta.id.clone());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    existing
}

/// Reject policy rules the API server would refuse
///
/// A rule needs verbs and targets either resources (with api groups) or
/// non-resource URLs, never both. Namespaced roles cannot use URLs.
pub(crate) fn validate_rules(kind: FederatedKind, rules: &[PolicyRule]) -> Result<()> {
    for (index, rule) in rules.iter().enumerate() {
        let invalid = |field: &str, message: &str| -> crate::FederationError {
            Error::validation_for_field(
                kind.keyword(),
                format!("spec.template.rules[{}].{}", index, field),
                message,
            )
            .into()
        };
        let has_resources = rule.resources.as_ref().is_some_and(|r| !r.is_empty());
        let has_urls = rule.non_resource_urls.as_ref().is_some_and(|u| !u.is_empty());

        if rule.verbs.is_empty() {
            return Err(invalid("verbs", "at least one verb is required"));
        }
        if has_urls && kind.is_namespaced() {
            return Err(invalid(
                "nonResourceURLs",
                "namespaced rules cannot apply to non-resource URLs",
            ));
        }
        match (has_resources, has_urls) {
            (false, false) => {
                return Err(invalid(
                    "resources",
                    "rule must name resources or non-resource URLs",
                ))
            }
            (true, true) => {
                return Err(invalid(
                    "nonResourceURLs",
                    "rule cannot apply to both resources and non-resource URLs",
                ))
            }
            _ => {}
        }
        if has_resources && rule.api_groups.as_ref().map_or(true, Vec::is_empty) {
            return Err(invalid(
                "apiGroups",
                "resource rules must supply at least one api group",
            ));
        }
    }
    Ok(())
}

/// Name lookup for federated roles referenced by bindings
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoleLookup: Send + Sync {
    /// True if a federated role of `kind` named `name` exists
    async fn role_exists(&self, kind: FederatedKind, name: &str) -> Result<bool>;
}

/// [`RoleLookup`] backed by the cluster role and role template stores
pub struct TemplateRoleLookup {
    cluster_roles: Arc<dyn TemplateStore<FederatedClusterRoleSpec>>,
    roles: Arc<dyn TemplateStore<FederatedRoleSpec>>,
}

impl TemplateRoleLookup {
    /// Create a lookup over the two role stores
    pub fn new(
        cluster_roles: Arc<dyn TemplateStore<FederatedClusterRoleSpec>>,
        roles: Arc<dyn TemplateStore<FederatedRoleSpec>>,
    ) -> Self {
        Self {
            cluster_roles,
            roles,
        }
    }
}

#[async_trait]
impl RoleLookup for TemplateRoleLookup {
    async fn role_exists(&self, kind: FederatedKind, name: &str) -> Result<bool> {
        match kind {
            FederatedKind::ClusterRole => Ok(self.cluster_roles.find_by_name(name).await?.is_some()),
            FederatedKind::Role => Ok(self.roles.find_by_name(name).await?.is_some()),
            other => Err(Error::validation_for(
                other.keyword(),
                "only ClusterRole and Role can be referenced by a binding",
            )
            .into()),
        }
    }
}

/// A binding's roleRef must name an existing federated role of an allowed kind
pub(crate) async fn validate_role_ref(
    binding: FederatedKind,
    role_ref: &RoleRef,
    lookup: &dyn RoleLookup,
) -> Result<()> {
    let role_kind = match (binding, role_ref.kind.as_str()) {
        (_, "ClusterRole") => FederatedKind::ClusterRole,
        (FederatedKind::RoleBinding, "Role") => FederatedKind::Role,
        (_, other) => {
            return Err(Error::validation_for_field(
                binding.keyword(),
                "spec.template.roleRef.kind",
                format!("role kind {:?} is not supported", other),
            )
            .into())
        }
    };
    if !lookup.role_exists(role_kind, &role_ref.name).await? {
        return Err(Error::not_found(role_kind.keyword(), role_ref.name.clone()).into());
    }
    Ok(())
}

/// roleRef cannot change once a binding exists
pub(crate) fn validate_role_ref_unchanged(
    binding: FederatedKind,
    old: &RoleRef,
    new: &RoleRef,
) -> Result<()> {
    if old != new {
        return Err(Error::validation_for_field(
            binding.keyword(),
            "spec.template.roleRef",
            format!(
                "roleRef is immutable: {}/{} cannot become {}/{}",
                old.kind, old.name, new.kind, new.name
            ),
        )
        .into());
    }
    Ok(())
}
