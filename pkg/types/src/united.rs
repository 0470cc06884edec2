use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::condition::Condition;
use crate::deployment::DeploymentSpec;
use crate::meta::{ObjectMeta, Resource};
use crate::pod::{NodeSelectorTerm, TemplateMeta, Toleration};
use crate::selector::LabelSelector;
use crate::statefulset::StatefulSetSpec;

/// Workload kind a UnitedDeployment provisions its pools as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TemplateType {
    Deployment,
    StatefulSet,
}

impl std::fmt::Display for TemplateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateType::Deployment => write!(f, "Deployment"),
            TemplateType::StatefulSet => write!(f, "StatefulSet"),
        }
    }
}

// --- Workload templates ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulSetTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: StatefulSetSpec,
}

/// Exactly one member is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_template: Option<DeploymentTemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set_template: Option<StatefulSetTemplateSpec>,
}

impl WorkloadTemplate {
    /// The selected kind. StatefulSet wins when both are set.
    pub fn template_type(&self) -> Option<TemplateType> {
        if self.stateful_set_template.is_some() {
            Some(TemplateType::StatefulSet)
        } else if self.deployment_template.is_some() {
            Some(TemplateType::Deployment)
        } else {
            None
        }
    }

    /// Labels of the selected template.
    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        match self.template_type()? {
            TemplateType::StatefulSet => self
                .stateful_set_template
                .as_ref()
                .map(|t| &t.metadata.labels),
            TemplateType::Deployment => self
                .deployment_template
                .as_ref()
                .map(|t| &t.metadata.labels),
        }
    }
}

// --- Topology ---

/// One named pool of the topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// DNS label, unique within the resource. Prefixes the workload name.
    pub name: String,
    /// Nodes eligible for this pool's pods. Not updated once the pool exists.
    #[serde(default)]
    pub node_selector_term: NodeSelectorTerm,
    /// Not updated once the pool exists.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Partial workload document merged over the generated workload.
    /// `spec.replicas` inside the patch wins over `replicas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
}

impl PoolSpec {
    /// Desired replicas after the patch has had its say.
    pub fn desired_replicas(&self) -> u32 {
        self.patch
            .as_ref()
            .and_then(|p| p.pointer("/spec/replicas"))
            .and_then(serde_json::Value::as_u64)
            .and_then(|r| u32::try_from(r).ok())
            .or(self.replicas)
            .unwrap_or(0)
    }

    /// The patch in the canonical form stored in the patch annotation.
    pub fn patch_content(&self) -> Option<String> {
        self.patch.as_ref().map(|p| p.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
}

// --- Spec ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeploymentSpec {
    /// Must match the pods of every pool.
    pub selector: LabelSelector,
    #[serde(default)]
    pub workload_template: WorkloadTemplate,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<u32>,
}

// --- Status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitedDeploymentConditionType {
    /// Every expected pool exists and no unexpected pool is left.
    PoolProvisioned,
    /// Every pool runs the update revision.
    PoolUpdated,
    /// At least one pool reports a failure of its own.
    PoolFailure,
}

pub type UnitedDeploymentCondition = Condition<UnitedDeploymentConditionType>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeploymentStatus {
    #[serde(default)]
    pub observed_generation: i64,
    /// Bumped whenever a revision name clashes with a different revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<u32>,
    #[serde(default)]
    pub current_revision: String,
    #[serde(default)]
    pub conditions: Vec<UnitedDeploymentCondition>,
    #[serde(default)]
    pub pool_replicas: BTreeMap<String, u32>,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_type: Option<TemplateType>,
}

// --- UnitedDeployment ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeployment {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: UnitedDeploymentSpec,
    #[serde(default)]
    pub status: UnitedDeploymentStatus,
}

impl UnitedDeployment {
    pub fn pool(&self, name: &str) -> Option<&PoolSpec> {
        self.spec.topology.pools.iter().find(|p| p.name == name)
    }

    pub fn revision_history_limit(&self) -> u32 {
        self.spec
            .revision_history_limit
            .unwrap_or(pkg_constants::controller::DEFAULT_REVISION_HISTORY_LIMIT)
    }
}

impl Resource for UnitedDeployment {
    const API_VERSION: &'static str = "apps.udm.dev/v1alpha1";
    const KIND: &'static str = "UnitedDeployment";
    const PLURAL: &'static str = "uniteddeployments";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
