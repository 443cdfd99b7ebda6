use k8s_openapi::jiff::Timestamp;

use super::{OpsBehaviour, OpsContext};
use crate::{
    cli::EngineOptions,
    crd::{
        Cluster, ClusterPhase, ComponentPhase, OpsRequest, OpsType,
        cluster::{ClusterComponentStatus, ClusterStatus, VolumeClaimTemplate},
        ops_request::OpsRequestSpec,
    },
    reconfigure,
    test::{FakeSidecar, InMemoryStore, ts},
};

/// A running three replica `mycluster` with a single `mysql` component and a `data` volume.
pub fn cluster() -> Cluster {
    let mut cluster = reconfigure::test_support::cluster();
    cluster.metadata.generation = Some(1);
    if let Some(component) = cluster.component_mut("mysql") {
        component.volume_claim_templates = vec![VolumeClaimTemplate {
            name: "data".to_owned(),
            storage: "10Gi".to_owned(),
            storage_class_name: None,
        }];
    }
    cluster.status = Some(ClusterStatus {
        phase: Some(ClusterPhase::Running),
        observed_generation: Some(1),
        components: [(
            "mysql".to_owned(),
            ClusterComponentStatus {
                phase: ComponentPhase::Running,
                message: None,
            },
        )]
        .into(),
    });
    cluster
}

pub fn set_phases(cluster: &mut Cluster, phase: ClusterPhase, component: ComponentPhase) {
    let status = cluster.status.get_or_insert_with(ClusterStatus::default);
    status.phase = Some(phase);
    status
        .components
        .entry("mysql".to_owned())
        .or_insert_with(|| ClusterComponentStatus {
            phase: component,
            message: None,
        })
        .phase = component;
}

pub fn spec(type_: OpsType) -> OpsRequestSpec {
    OpsRequestSpec {
        cluster_ref: "mycluster".to_owned(),
        type_,
        upgrade: None,
        vertical_scaling: Vec::new(),
        horizontal_scaling: Vec::new(),
        volume_expansion: Vec::new(),
        restart: Vec::new(),
        reconfigure: None,
    }
}

pub fn request(name: &str, spec: OpsRequestSpec) -> OpsRequest {
    let mut request = OpsRequest::new(name, spec);
    request.metadata.namespace = Some("default".to_owned());
    request.metadata.generation = Some(1);
    request
}

/// The collaborators of a handler under test.
#[derive(Default)]
pub struct Harness {
    pub store: InMemoryStore,
    pub sidecar: FakeSidecar,
    pub options: EngineOptions,
}

impl Harness {
    pub fn ctx<'a>(
        &'a self,
        behaviour: &'a OpsBehaviour,
        now: Timestamp,
    ) -> OpsContext<'a, InMemoryStore> {
        OpsContext {
            store: &self.store,
            sidecar: &self.sidecar,
            options: &self.options,
            behaviour,
            now,
            events: Vec::new(),
        }
    }
}

pub const NOW: i64 = 10_000;

pub fn now() -> Timestamp {
    ts(NOW)
}
