use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, NamespaceSpec};
use serde::{Deserialize, Serialize};

use super::{projected_meta, refreshed_meta, Placement, ResourceProjector};
use crate::model::{validate_resource_name, FederatedKind, FederatedTemplate};
use crate::Result;

/// Federated namespace payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedNamespaceSpec {
    /// What every member cluster gets
    pub template: NamespaceTemplate,
}

/// Namespace template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceTemplate {
    /// Extra labels for the cluster namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Namespace spec (finalizers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<NamespaceSpec>,
}

/// Projects federated namespaces
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceProjector;

#[async_trait]
impl ResourceProjector for NamespaceProjector {
    type Spec = FederatedNamespaceSpec;
    type Resource = Namespace;
    const KIND: FederatedKind = FederatedKind::Namespace;

    fn build_create(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        _placement: &Placement<'_>,
    ) -> Result<Namespace> {
        validate_resource_name(Self::KIND, template.name())?;
        let mut metadata = projected_meta(&template.meta, None);
        merge_labels(&mut metadata.labels, &template.spec.template.labels);
        Ok(Namespace {
            metadata,
            spec: template.spec.template.spec.clone(),
            status: None,
        })
    }

    fn build_update(
        &self,
        template: &FederatedTemplate<Self::Spec>,
        existing: Namespace,
    ) -> Result<Namespace> {
        let mut metadata = refreshed_meta(existing.metadata, &template.meta);
        merge_labels(&mut metadata.labels, &template.spec.template.labels);
        Ok(Namespace {
            metadata,
            spec: template.spec.template.spec.clone().or(existing.spec),
            status: existing.status,
        })
    }

    async fn validate_create(&self, template: &FederatedTemplate<Self::Spec>) -> Result<()> {
        validate_resource_name(Self::KIND, template.name())?;
        Ok(())
    }
}

fn merge_labels(target: &mut Option<BTreeMap<String, String>>, extra: &BTreeMap<String, String>) {
    if extra.is_empty() {
        return;
    }
    let labels = target.get_or_insert_with(BTreeMap::new);
    for (k, v) in extra {
        labels.insert(k.clone(), v.clone());
    }
}

/// True when the namespace reports phase `Active`
pub fn namespace_is_active(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Active")
}
