//! The `Cluster` resource as far as the operation engine reads and writes it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A database cluster made up of one or more components.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "apps.dbops.dev",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Name of the ClusterVersion the cluster runs.
    pub cluster_version_ref: String,

    #[serde(default)]
    pub components: Vec<ClusterComponentSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    pub name: String,

    #[serde(default)]
    pub workload_type: WorkloadType,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    /// Replication roles a pod of this component can take, e.g. leader and follower.
    #[serde(default)]
    pub roles: Vec<ReplicaRole>,

    #[serde(default)]
    pub config_specs: Vec<ComponentConfigSpec>,

    /// Minimum number of seconds a pod must be ready before it counts as available.
    #[serde(default)]
    pub min_ready_seconds: i32,
}

impl ClusterComponentSpec {
    pub fn volume_claim_template(&self, name: &str) -> Option<&VolumeClaimTemplate> {
        self.volume_claim_templates.iter().find(|vct| vct.name == name)
    }

    pub fn config_spec(&self, name: &str) -> Option<&ComponentConfigSpec> {
        self.config_specs.iter().find(|spec| spec.name == name)
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
    strum::Display,
)]
pub enum WorkloadType {
    /// A replicated set with an elected leader, followers and optional learners.
    Consensus,
    #[default]
    Stateful,
    /// A primary/secondary replicated set.
    Replication,
    Stateless,
}

impl WorkloadType {
    /// Stateful families are backed by a StatefulSet with stable pod identities.
    pub fn is_stateful(self) -> bool {
        !matches!(self, Self::Stateless)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,

    /// Requested storage size, e.g. `10Gi`.
    pub storage: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRole {
    pub name: String,

    #[serde(default)]
    pub is_leader: bool,

    #[serde(default)]
    pub can_vote: bool,

    #[serde(default)]
    pub access_mode: AccessMode,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, strum::Display,
)]
pub enum AccessMode {
    ReadWrite,
    Readonly,
    #[default]
    None,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfigSpec {
    pub name: String,

    /// Name of the ConfigConstraint classifying the parameters of this config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint_ref: Option<String>,

    /// Containers that mount the config and have to be restarted to pick it up.
    #[serde(default)]
    pub container_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub components: BTreeMap<String, ClusterComponentStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentStatus {
    #[serde(default)]
    pub phase: ComponentPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
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
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
)]
pub enum ClusterPhase {
    #[default]
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
    VerticalScaling,
    HorizontalScaling,
    VolumeExpanding,
    Rebooting,
    Reconfiguring,
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
pub enum ComponentPhase {
    #[default]
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Failed,
    Abnormal,
    VerticalScaling,
    HorizontalScaling,
    VolumeExpanding,
    Rebooting,
    Reconfiguring,
}

impl ComponentPhase {
    /// Completed components are no longer being worked on by the cluster controller.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Stopped | Self::Failed | Self::Abnormal
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed | Self::Abnormal)
    }
}

impl Cluster {
    pub fn component(&self, name: &str) -> Option<&ClusterComponentSpec> {
        self.spec.components.iter().find(|comp| comp.name == name)
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut ClusterComponentSpec> {
        self.spec.components.iter_mut().find(|comp| comp.name == name)
    }

    pub fn phase(&self) -> Option<ClusterPhase> {
        self.status.as_ref().and_then(|status| status.phase)
    }

    pub fn component_phase(&self, name: &str) -> Option<ComponentPhase> {
        self.status
            .as_ref()
            .and_then(|status| status.components.get(name))
            .map(|comp| comp.phase)
    }

    /// Returns `true` once the cluster controller has observed the given generation.
    pub fn has_observed(&self, generation: Option<i64>) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        match (observed, generation) {
            (Some(observed), Some(generation)) => observed >= generation,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }

    /// Name of the workload backing the given component.
    pub fn workload_name(&self, component: &str) -> String {
        format!("{}-{component}", self.name_any())
    }

    /// Name of the ConfigMap holding the rendered config spec of a component.
    pub fn config_map_name(&self, component: &str, config_spec: &str) -> String {
        format!("{}-{component}-{config_spec}", self.name_any())
    }
}
