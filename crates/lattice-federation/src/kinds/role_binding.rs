use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use serde::{Deserialize, Serialize};

use super::role::require_namespace;
use super::{
    projected_meta, refreshed_meta, validate_role_ref, validate_role_ref_unchanged, Placement,
    ResourceProjector, RoleLookup,
};
use crate::model::{validate_resource_name, FederatedKind, FederatedTemplate};
use crate::Result;

/// Federated role binding payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedRoleBindingSpec {
    pub template: RoleBindingTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindingTemplate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

/// Projects federated role bindings
pub struct RoleBindingProjector {
    roles: Arc<dyn RoleLookup>,
}

impl RoleBindingProjector {
    /// `roles` resolves the roleRef at creation time
    pub fn new(roles: Arc<dyn RoleLookup>) -> Self {
        Self { roles }
    }
}

#[async_trait]
impl ResourceProjector for RoleBindingProjector {
    type Spec = FederatedRoleBindingSpec;
    type Resource = RoleBinding;
    const KIND: FederatedKind = FederatedKind::RoleBinding;

    fn build_create(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        placement: &Placement<'_>,
    ) -> Result<RoleBinding> {
        validate_resource_name(Self::KIND, template.name())?;
        let namespace = require_namespace(Self::KIND, placement)?;
        let spec = &template.spec.template;
        Ok(RoleBinding {
            metadata: projected_meta(&template.meta, Some(&namespace)),
            role_ref: spec.role_ref.clone(),
            subjects: (!spec.subjects.is_empty()).then(|| spec.subjects.clone()),
        })
    }

    fn build_update(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        existing: RoleBinding,
    ) -> Result<RoleBinding> {
        let spec = &template.spec.template;
        Ok(RoleBinding {
            metadata: refreshed_meta(existing.metadata, &template.meta),
            role_ref: existing.role_ref,
            subjects: (!spec.subjects.is_empty()).then(|| spec.subjects.clone()),
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
