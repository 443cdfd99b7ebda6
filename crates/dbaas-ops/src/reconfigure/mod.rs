//! Rolling out a changed configuration to the pods of a component.
//!
//! A policy invocation performs one bounded step and reports an [`ExecStatus`]. Callers keep
//! invoking the policy until it reports [`ExecStatus::None`], so a rollout survives restarts of
//! the operator and never blocks waiting for pods.

use std::{collections::BTreeMap, convert::Infallible};

use k8s_openapi::{api::core::v1::Pod, jiff::Timestamp};
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::{
    client::{Mutation, ObjectStore, StoreError, UpdateError, UpdateTarget, update_with_retry},
    constants::{COMPONENT_NAME_KEY, K8S_APP_INSTANCE_KEY, config_version_key},
    crd::{
        Cluster, ClusterComponentSpec, cluster::ComponentConfigSpec,
        ops_request::ReconfigurePolicyType,
    },
    reconfigure::sidecar::{SidecarClient, SidecarError, container_ids, sidecar_address},
};

pub mod diff;
pub mod format;
pub mod orderer;
mod parallel;
mod rolling;
pub mod sidecar;
mod simple;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list the pods of component {component:?}"))]
    ListPods {
        source: StoreError,
        component: String,
    },

    #[snafu(display("failed to resolve the sidecar of pod {pod:?}"))]
    ResolveSidecar { source: SidecarError, pod: String },

    #[snafu(display("failed to stop the containers of pod {pod:?}"))]
    StopContainer { source: SidecarError, pod: String },

    #[snafu(display("failed to label pod {pod:?} with the new config version"))]
    PatchPod {
        source: UpdateError<Infallible>,
        pod: String,
    },

    #[snafu(display("failed to update the pod template of workload {workload:?}"))]
    PatchWorkload {
        source: UpdateError<Infallible>,
        workload: String,
    },
}

impl Error {
    /// Every error of a policy step is worth retrying the same step for.
    pub fn exec_status(&self) -> ExecStatus {
        ExecStatus::RetryFailed
    }
}

/// Outcome of one policy invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ExecStatus {
    /// The change is fully applied.
    None,
    /// Partially applied, invoke again.
    Retry,
    /// The change cannot be applied.
    Failed,
    /// A transient error occurred, invoke again.
    RetryFailed,
    /// The workload type of the component cannot be handled by the policy.
    NotSupported,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconfigureOutcome {
    pub status: ExecStatus,
    pub succeed_count: i32,
    pub expected_count: i32,
}

impl ReconfigureOutcome {
    pub fn new(status: ExecStatus, succeed_count: usize, expected_count: i32) -> Self {
        Self {
            status,
            succeed_count: i32::try_from(succeed_count).unwrap_or(i32::MAX),
            expected_count,
        }
    }
}

/// Everything a policy needs to roll out one config spec of one component.
pub struct ReconfigureParams<'a, S> {
    pub store: &'a S,
    pub sidecar: &'a dyn SidecarClient,
    pub cluster: &'a Cluster,
    pub component: &'a ClusterComponentSpec,
    pub config_spec: &'a ComponentConfigSpec,
    /// Version of the rendered config that pods are moved to.
    pub target_version: &'a str,
    pub sidecar_port: u16,
    pub conflict_retries: usize,
    pub now: Timestamp,
}

impl<S: ObjectStore> ReconfigureParams<'_, S> {
    fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }

    fn version_key(&self) -> String {
        config_version_key(&self.config_spec.name)
    }

    fn is_updated(&self, pod: &Pod) -> bool {
        pod.labels().get(&self.version_key()).map(String::as_str) == Some(self.target_version)
    }

    fn not_supported(&self) -> Option<ReconfigureOutcome> {
        (!self.component.workload_type.is_stateful()).then(|| {
            ReconfigureOutcome::new(ExecStatus::NotSupported, 0, self.component.replicas)
        })
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, Error> {
        let selector = BTreeMap::from([
            (K8S_APP_INSTANCE_KEY.to_owned(), self.cluster.name_any()),
            (COMPONENT_NAME_KEY.to_owned(), self.component.name.clone()),
        ]);
        let mut pods: Vec<Pod> = self
            .store
            .list(&self.namespace(), &selector)
            .await
            .context(ListPodsSnafu {
                component: &self.component.name,
            })?;
        pods.retain(|pod| pod.metadata.deletion_timestamp.is_none());
        Ok(pods)
    }

    /// Asks the sidecar of `pod` to stop the containers mounting the config.
    async fn stop_containers(&self, pod: &Pod) -> Result<(), Error> {
        let name = pod.name_any();
        let address =
            sidecar_address(pod, self.sidecar_port).context(ResolveSidecarSnafu { pod: &name })?;
        let ids = container_ids(pod, &self.config_spec.container_names)
            .context(ResolveSidecarSnafu { pod: &name })?;
        self.sidecar
            .stop_container(&address, &ids)
            .await
            .context(StopContainerSnafu { pod: name })
    }

    /// Marks `pod` as running the target version.
    async fn label_pod(&self, pod: &Pod) -> Result<(), Error> {
        let key = self.version_key();
        let name = pod.name_any();
        update_with_retry::<_, Pod, Infallible, _, _>(
            self.store,
            &self.namespace(),
            &name,
            UpdateTarget::Object,
            self.conflict_retries,
            |pod| {
                let labels = pod.labels_mut();
                if labels.get(&key).map(String::as_str) == Some(self.target_version) {
                    return Ok(Mutation::Unchanged(()));
                }
                labels.insert(key.clone(), self.target_version.to_owned());
                Ok(Mutation::Changed(()))
            },
        )
        .await
        .context(PatchPodSnafu { pod: name })?;
        Ok(())
    }
}

/// Runs one step of the given policy.
#[tracing::instrument(
    skip(params),
    fields(
        cluster = %params.cluster.name_any(),
        component = %params.component.name,
        config_spec = %params.config_spec.name,
        version = params.target_version,
    )
)]
pub async fn upgrade<S: ObjectStore>(
    policy: ReconfigurePolicyType,
    params: &ReconfigureParams<'_, S>,
) -> Result<ReconfigureOutcome, Error> {
    let outcome = match policy {
        ReconfigurePolicyType::AutoReload => Ok(ReconfigureOutcome::new(
            ExecStatus::None,
            usize::try_from(params.component.replicas).unwrap_or_default(),
            params.component.replicas,
        )),
        ReconfigurePolicyType::Simple => simple::upgrade(params).await,
        ReconfigurePolicyType::Parallel => parallel::upgrade(params).await,
        ReconfigurePolicyType::Rolling => rolling::upgrade(params).await,
    };
    match &outcome {
        Ok(outcome) => tracing::debug!(
            status = %outcome.status,
            succeed = outcome.succeed_count,
            expected = outcome.expected_count,
            "reconfigure step finished"
        ),
        Err(err) => tracing::warn!(
            error = err as &dyn std::error::Error,
            "reconfigure step failed, it will be retried"
        ),
    }
    outcome
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{
        crd::{
            Cluster, ClusterComponentSpec, WorkloadType,
            cluster::{AccessMode, ClusterSpec, ComponentConfigSpec, ReplicaRole},
        },
        test::{FakeSidecar, InMemoryStore, ts},
    };

    use super::ReconfigureParams;

    pub const VERSION: &str = "f00dbabe";

    pub fn cluster() -> Cluster {
        let mut cluster = Cluster::new(
            "mycluster",
            ClusterSpec {
                cluster_version_ref: "v1".to_owned(),
                components: vec![component(WorkloadType::Consensus, 3)],
            },
        );
        cluster.metadata.namespace = Some("default".to_owned());
        cluster
    }

    pub fn component(workload_type: WorkloadType, replicas: i32) -> ClusterComponentSpec {
        ClusterComponentSpec {
            name: "mysql".to_owned(),
            workload_type,
            replicas,
            roles: vec![
                ReplicaRole {
                    name: "leader".to_owned(),
                    is_leader: true,
                    can_vote: true,
                    access_mode: AccessMode::ReadWrite,
                },
                ReplicaRole {
                    name: "follower".to_owned(),
                    is_leader: false,
                    can_vote: true,
                    access_mode: AccessMode::Readonly,
                },
            ],
            config_specs: vec![config_spec()],
            ..ClusterComponentSpec::default()
        }
    }

    pub fn config_spec() -> ComponentConfigSpec {
        ComponentConfigSpec {
            name: "mysql-config".to_owned(),
            constraint_ref: None,
            container_names: vec!["mysql".to_owned()],
        }
    }

    pub fn params<'a>(
        store: &'a InMemoryStore,
        sidecar: &'a FakeSidecar,
        cluster: &'a Cluster,
        component: &'a ClusterComponentSpec,
        config_spec: &'a ComponentConfigSpec,
    ) -> ReconfigureParams<'a, InMemoryStore> {
        ReconfigureParams {
            store,
            sidecar,
            cluster,
            component,
            config_spec,
            target_version: VERSION,
            sidecar_port: 9901,
            conflict_retries: 3,
            now: ts(10_000),
        }
    }
}
