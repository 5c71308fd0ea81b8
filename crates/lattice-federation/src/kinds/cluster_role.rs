use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{AggregationRule, ClusterRole, PolicyRule};
use serde::{Deserialize, Serialize};

use super::{projected_meta, refreshed_meta, validate_rules, Placement, ResourceProjector};
use crate::model::{validate_resource_name, FederatedKind, FederatedTemplate};
use crate::Result;

/// Federated cluster role payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedClusterRoleSpec {
    pub template: ClusterRoleTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleTemplate {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_rule: Option<AggregationRule>,
}

/// Projects federated cluster roles
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterRoleProjector;

#[async_trait]
impl ResourceProjector for ClusterRoleProjector {
    type Spec = FederatedClusterRoleSpec;
    type Resource = ClusterRole;
    const KIND: FederatedKind = FederatedKind::ClusterRole;

    fn build_create(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        _placement: &Placement<'_>,
    ) -> Result<ClusterRole> {
        validate_resource_name(Self::KIND, template.name())?;
        Ok(ClusterRole {
            metadata: projected_meta(&template.meta, None),
            rules: Some(template.spec.template.rules.clone()),
            aggregation_rule: template.spec.template.aggregation_rule.clone(),
        })
    }

    fn build_update(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        existing: ClusterRole,
    ) -> Result<ClusterRole> {
        Ok(ClusterRole {
            metadata: refreshed_meta(existing.metadata, &template.meta),
            rules: Some(template.spec.template.rules.clone()),
            aggregation_rule: template.spec.template.aggregation_rule.clone(),
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
