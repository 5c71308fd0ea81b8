use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role};
use serde::{Deserialize, Serialize};

use lattice_common::Error;

use super::{projected_meta, refreshed_meta, validate_rules, Placement, ResourceProjector};
use crate::model::{validate_resource_name, FederatedKind, FederatedTemplate};
use crate::Result;

/// Federated role payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedRoleSpec {
    pub template: RoleTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleTemplate {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Projects federated roles into the cluster namespace of their federated namespace
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleProjector;

pub(super) fn require_namespace(kind: FederatedKind, placement: &Placement<'_>) -> Result<String> {
    placement.namespace.map(str::to_string).ok_or_else(|| {
        Error::internal_with_context(kind.keyword(), "namespaced resource placed without a namespace")
            .into()
    })
}

#[async_trait]
impl ResourceProjector for RoleProjector {
    type Spec = FederatedRoleSpec;
    type Resource = Role;
    const KIND: FederatedKind = FederatedKind::Role;

    fn build_create(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        placement: &Placement<'_>,
    ) -> Result<Role> {
        validate_resource_name(Self::KIND, template.name())?;
        let namespace = require_namespace(Self::KIND, placement)?;
        Ok(Role {
            metadata: projected_meta(&template.meta, Some(&namespace)),
            rules: Some(template.spec.template.rules.clone()),
        })
    }

    fn build_update(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        existing: Role,
    ) -> Result<Role> {
        Ok(Role {
            metadata: refreshed_meta(existing.metadata, &template.meta),
            rules: Some(template.spec.template.rules.clone()),
        })
    }

    async fn validate_create(&self, template: &FederatedTemplate<Self::Spec>) -> Result<()> {
        validate_resource_name(Self::KIND, template.name())?;
        validate_rules(Self::KIND, &template.spec.template.rules)
    }

    fn validate_update(
        &self,
        _old: &FederatedTemplate<Self::Spec>,
        new: &FederatedTemplate<Self::Spec>,
    ) -> Result<()> {
        validate_rules(Self::KIND, &new.spec.template.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cluster;
    use lattice_common::ErrorKind;

    fn template() -> FederatedTemplate<FederatedRoleSpec> {
        FederatedTemplate::new(
            "reader",
            "dom",
            FederatedRoleSpec {
                template: RoleTemplate {
                    rules: vec![PolicyRule {
                        api_groups: Some(vec![String::new()]),
                        resources: Some(vec!["configmaps".to_string()]),
                        verbs: vec!["get".to_string()],
                        ..Default::default()
                    }],
                },
            },
        )
        .in_namespace("fedns-1")
    }

    #[test]
    fn role_lands_in_resolved_namespace() {
        let cluster = Cluster::running("c1", "a", "dom");
        let role = RoleProjector
            .build_create(
                &template(),
                &Placement {
                    cluster: &cluster,
                    namespace: Some("team-a"),
                },
            )
            .unwrap();
        assert_eq!(role.metadata.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn missing_namespace_is_internal() {
        let cluster = Cluster::running("c1", "a", "dom");
        let err = RoleProjector
            .build_create(
                &template(),
                &Placement {
                    cluster: &cluster,
                    namespace: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
