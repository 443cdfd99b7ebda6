//! The `OpsRequest` resource: a declarative intent to change a running cluster.

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::ResourceRequirements, apimachinery::pkg::apis::meta::v1::Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

use crate::status::condition::OpsCondition;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum UpdateError {
    #[snafu(display("update OpsRequest: {name} is forbidden when status.Phase is {phase}"))]
    UpdateForbidden { name: String, phase: OpsPhase },
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "apps.dbops.dev",
    version = "v1alpha1",
    kind = "OpsRequest",
    namespaced,
    shortname = "ops",
    status = "OpsRequestStatus",
    derive = "PartialEq",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestSpec {
    /// Name of the Cluster (in the same namespace) this request operates on.
    pub cluster_ref: String,

    #[serde(rename = "type")]
    pub type_: OpsType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<Upgrade>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vertical_scaling: Vec<VerticalScaling>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub horizontal_scaling: Vec<HorizontalScaling>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_expansion: Vec<VolumeExpansion>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restart: Vec<ComponentOps>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconfigure: Option<Reconfigure>,
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum OpsType {
    Upgrade,
    VerticalScaling,
    HorizontalScaling,
    VolumeExpansion,
    Restart,
    Reconfigure,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Upgrade {
    pub cluster_version_ref: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOps {
    pub component_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerticalScaling {
    pub component_name: String,
    pub resources: ResourceRequirements,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    pub component_name: String,
    pub replicas: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeExpansion {
    pub component_name: String,
    pub volume_claim_templates: Vec<OpsVolumeClaimTemplate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpsVolumeClaimTemplate {
    pub name: String,
    pub storage: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reconfigure {
    pub component_name: String,

    pub configurations: Vec<Configuration>,

    /// How pods are restarted when the change cannot be reloaded in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ReconfigurePolicyType>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Name of the config spec of the component.
    pub name: String,

    pub keys: Vec<ParameterConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterConfig {
    /// Name of the config file inside the config spec.
    pub key: String,

    pub parameters: Vec<ParameterPair>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterPair {
    pub key: String,

    /// The new value. A missing value removes the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    JsonSchema,
    PartialEq,
    Eq,
    strum::Display,
)]
pub enum ReconfigurePolicyType {
    /// The process reloads the config by itself, no pod is restarted.
    AutoReload,
    #[default]
    Simple,
    Parallel,
    Rolling,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestStatus {
    #[serde(default)]
    pub phase: OpsPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Generation of the cluster after the action was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_generation: Option<i64>,

    /// Progress as `succeeded/expected`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,

    #[serde(default)]
    pub last_configuration: LastConfiguration,

    #[serde(default)]
    pub components: BTreeMap<String, OpsRequestComponentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconfiguring_status: Option<ReconfiguringStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<Time>,

    #[serde(default)]
    pub conditions: Vec<OpsCondition>,
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    JsonSchema,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
)]
pub enum OpsPhase {
    #[default]
    Pending,
    Running,
    Succeed,
    Failed,
}

impl OpsPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeed | Self::Failed)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<crate::crd::cluster::ComponentPhase>,

    #[serde(default)]
    pub progress_details: Vec<ProgressDetail>,
}

/// Progress of a single object (pod or PVC) affected by an operation.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetail {
    /// `Kind/Name` of the object.
    pub object_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default)]
    pub status: ProgressStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Time>,
}

impl ProgressDetail {
    pub fn new(object_key: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            object_key: object_key.into(),
            status,
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    JsonSchema,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
)]
pub enum ProgressStatus {
    #[default]
    Pending,
    Processing,
    Succeed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeed | Self::Failed)
    }
}

/// The cluster configuration before the operation was applied.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_version_ref: Option<String>,

    #[serde(default)]
    pub components: BTreeMap<String, LastComponentConfiguration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastComponentConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Volume claim template name to storage size.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_claim_templates: BTreeMap<String, String>,

    /// Config file name to content, for reconfigure requests.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_files: BTreeMap<String, String>,
}

/// Rollout state of a reconfigure request.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconfiguringStatus {
    pub config_spec: String,

    pub policy: ReconfigurePolicyType,

    /// Version of the rendered config the pods are moved to.
    pub target_version: String,

    #[serde(default)]
    pub updated_keys: Vec<String>,

    #[serde(default)]
    pub succeed_count: i32,

    #[serde(default)]
    pub expected_count: i32,

    /// Outcome of the last policy invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exec_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OpsRequest {
    pub fn phase(&self) -> OpsPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut OpsRequestStatus {
        self.status.get_or_insert_with(OpsRequestStatus::default)
    }

    /// Names of the components this request operates on, in request order.
    pub fn component_names(&self) -> Vec<&str> {
        let spec = &self.spec;
        match spec.type_ {
            OpsType::Upgrade => Vec::new(),
            OpsType::VerticalScaling => spec
                .vertical_scaling
                .iter()
                .map(|v| v.component_name.as_str())
                .collect(),
            OpsType::HorizontalScaling => spec
                .horizontal_scaling
                .iter()
                .map(|h| h.component_name.as_str())
                .collect(),
            OpsType::VolumeExpansion => spec
                .volume_expansion
                .iter()
                .map(|v| v.component_name.as_str())
                .collect(),
            OpsType::Restart => spec
                .restart
                .iter()
                .map(|r| r.component_name.as_str())
                .collect(),
            OpsType::Reconfigure => spec
                .reconfigure
                .iter()
                .map(|r| r.component_name.as_str())
                .collect(),
        }
    }

    /// Rejects spec changes once the request has started.
    pub fn validate_update(&self, old: &Self) -> Result<(), UpdateError> {
        let phase = old.phase();
        let name = old.metadata.name.clone().unwrap_or_default();
        ensure!(
            phase == OpsPhase::Pending || self.spec == old.spec,
            UpdateForbiddenSnafu { name, phase }
        );
        Ok(())
    }
}
