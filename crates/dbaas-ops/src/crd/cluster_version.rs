use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A released combination of component images a cluster can run.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "apps.dbops.dev",
    version = "v1alpha1",
    kind = "ClusterVersion",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    /// Component name to container image.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
}
