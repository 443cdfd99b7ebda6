use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes the file format and parameter classification of a configuration template.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "apps.dbops.dev",
    version = "v1alpha1",
    kind = "ConfigConstraint",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigConstraintSpec {
    #[serde(default)]
    pub format: ConfigFormat,

    /// Parameters that require a process restart when changed.
    #[serde(default)]
    pub static_parameters: Vec<String>,

    /// Parameters that can be reloaded without restarting the process.
    #[serde(default)]
    pub dynamic_parameters: Vec<String>,

    /// Parameters that must not be changed after the cluster was created.
    #[serde(default)]
    pub immutable_parameters: Vec<String>,
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
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfigFormat {
    #[default]
    Ini,
    Properties,
    Yaml,
    Json,
}

/// Which parameters are known to be static or dynamic. An empty list counts as not declared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterClassification {
    pub static_parameters: Vec<String>,
    pub dynamic_parameters: Vec<String>,
}

impl From<&ConfigConstraintSpec> for ParameterClassification {
    fn from(spec: &ConfigConstraintSpec) -> Self {
        Self {
            static_parameters: spec.static_parameters.clone(),
            dynamic_parameters: spec.dynamic_parameters.clone(),
        }
    }
}

/// A ConfigMap-like view of config file name to file content.
pub type ConfigFiles = BTreeMap<String, String>;
