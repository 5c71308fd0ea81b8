use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use serde::{Deserialize, Serialize};

use super::{
    projected_meta, refreshed_meta, validate_role_ref, validate_role_ref_unchanged, Placement,
    ResourceProjector, RoleLookup,
};
use crate::model::{validate_resource_name, FederatedKind, FederatedTemplate};
use crate::Result;

/// Federated cluster role binding payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedClusterRoleBindingSpec {
    pub template: ClusterRoleBindingTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleBindingTemplate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

/// Projects federated cluster role bindings
pub struct ClusterRoleBindingProjector {
    roles: Arc<dyn RoleLookup>,
}

impl ClusterRoleBindingProjector {
    /// `roles` resolves the roleRef at creation time
    pub fn new(roles: Arc<dyn RoleLookup>) -> Self {
        Self { roles }
    }
}

fn subjects(template: &ClusterRoleBindingTemplate) -> Option<Vec<Subject>> {
    if template.subjects.is_empty() {
        None
    } else {
        Some(template.subjects.clone())
    }
}

#[async_trait]
impl ResourceProjector for ClusterRoleBindingProjector {
    type Spec = FederatedClusterRoleBindingSpec;
    type Resource = ClusterRoleBinding;
    const KIND: FederatedKind = FederatedKind::ClusterRoleBinding;

    fn build_create(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        _placement: &Placement<'_>,
    ) -> Result<ClusterRoleBinding> {
        validate_resource_name(Self::KIND, template.name())?;
        Ok(ClusterRoleBinding {
            metadata: projected_meta(&template.meta, None),
            role_ref: template.spec.template.role_ref.clone(),
            subjects: subjects(&template.spec.template),
        })
    }

    fn build_update(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        existing: ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        // roleRef is immutable on the API server; keep what the cluster has.
        Ok(ClusterRoleBinding {
            metadata: refreshed_meta(existing.metadata, &template.meta),
            role_ref: existing.role_ref,
            subjects: subjects(&template.spec.template),
        })
    }

    async fn validate_create(&self, template: &FederatedTemplate<Self::Spec>) -> Result<()> {
        validate_resource_name(Self::KIND, template.name())?;
        validate_role_ref(Self::KIND, &template.spec.template.role_ref, self.roles.as_ref()).await
    }

    fn validate_update(
        &self,
        old: &FederatedTemplate<Self::Spec>,
        new: &FederatedTemplate<Self::Spec>,
    ) -> Result<()> {
        validate_role_ref_unchanged(
            Self::KIND,
            &old.spec.template.role_ref,
            &new.spec.template.role_ref,
        )
    }
}
