//! The operation engine.
//!
//! Every [`OpsType`] is registered once in an [`OpsRegistry`] together with its
//! [`OpsBehaviour`]: the cluster phases it may start from, the phase it drives the cluster into
//! and the [`OpsHandler`] implementing its validation, action and progress tracking. The
//! [`manager::OpsManager`] drives an [`OpsRequest`] through
//! `Pending -> Running -> Succeed | Failed` on top of that.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    str::FromStr,
    time::Duration,
};

use k8s_openapi::jiff::Timestamp;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    cli::EngineOptions,
    client::{Mutation, ObjectStore, StoreError, UpdateError, UpdateTarget, update_with_retry},
    crd::{
        Cluster, ClusterPhase, OpsPhase, OpsRequest, OpsType, ops_request::LastConfiguration,
    },
    logging::{controller::ReconcilerError, k8s_events::OpsEvent},
    quantity::{ParseQuantityError, Quantity},
    reconfigure::{self, sidecar::SidecarClient},
};

mod component;
mod horizontal_scaling;
pub mod lock;
pub mod manager;
pub mod progress;
mod reconfiguring;
mod restart;
#[cfg(test)]
mod test_support;
mod upgrade;
mod vertical_scaling;
mod volume_expansion;

pub use manager::OpsManager;

/// Why an OpsRequest cannot be applied to its cluster. Validation failures are terminal.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValidationError {
    #[snafu(display("{field:?} can not be empty"))]
    EmptyPayload { field: &'static str },

    #[snafu(display("components {names:?} not found"))]
    ComponentsNotFound { names: Vec<String> },

    #[snafu(display(
        "OpsRequest type {ops_type} is forbidden when the cluster phase is {phase}"
    ))]
    ClusterPhaseForbidden { ops_type: OpsType, phase: String },

    #[snafu(display("replicas of component {component:?} must not be negative, got {replicas}"))]
    NegativeReplicas { component: String, replicas: i32 },

    #[snafu(display(
        "{resource} request {request:?} of component {component:?} exceeds its limit {limit:?}"
    ))]
    RequestExceedsLimit {
        component: String,
        resource: String,
        request: String,
        limit: String,
    },

    #[snafu(display("invalid quantity {value:?}"))]
    InvalidQuantity {
        source: ParseQuantityError,
        value: String,
    },

    #[snafu(display("volumeClaimTemplate {name:?} not found in component {component:?}"))]
    VolumeClaimTemplateNotFound { component: String, name: String },

    #[snafu(display(
        "requested storage {requested:?} of volumeClaimTemplate {name:?} in component \
         {component:?} is smaller than the current size {current:?}"
    ))]
    StorageShrink {
        component: String,
        name: String,
        current: String,
        requested: String,
    },

    #[snafu(display("storageClass {name:?} not found"))]
    StorageClassNotFound { name: String },

    #[snafu(display("storageClass {name:?} does not allow volume expansion"))]
    StorageClassNotExpandable { name: String },

    #[snafu(display("clusterVersion {name:?} not found"))]
    ClusterVersionNotFound { name: String },

    #[snafu(display("cluster is already at clusterVersion {name:?}"))]
    SameClusterVersion { name: String },

    #[snafu(display("exactly one configuration must be given, got {count}"))]
    ConfigurationCount { count: usize },

    #[snafu(display("config spec {name:?} not found in component {component:?}"))]
    ConfigSpecNotFound { component: String, name: String },

    #[snafu(display("config spec {name:?} has no config constraint"))]
    ConfigConstraintMissing { name: String },

    #[snafu(display("configConstraint {name:?} not found"))]
    ConfigConstraintNotFound { name: String },

    #[snafu(display("configmap {name:?} not found"))]
    ConfigMapNotFound { name: String },

    #[snafu(display("config file {file:?} not found in configmap {config_map:?}"))]
    ConfigFileNotFound { file: String, config_map: String },

    #[snafu(display("parameters {parameters:?} are immutable"))]
    ImmutableParameters { parameters: Vec<String> },

    #[snafu(display("failed to apply parameters to config file {file:?}"))]
    InvalidParameters {
        source: reconfigure::format::Error,
        file: String,
    },
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("OpsRequest type {ops_type} is not supported"))]
    UnsupportedOperation { ops_type: OpsType },

    #[snafu(display("cluster {cluster:?} not found"))]
    ClusterNotFound { cluster: String },

    #[snafu(display("OpsRequest failed validation"), context(false))]
    Validation { source: ValidationError },

    #[snafu(display(
        "cluster phase {phase} is held by OpsRequest {holder:?}, retry after it completes"
    ))]
    ConflictingOperation { phase: ClusterPhase, holder: String },

    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to get {kind} {name:?}"))]
    GetObject {
        source: StoreError,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to list {kind} objects"))]
    ListObjects { source: StoreError, kind: String },

    #[snafu(display("failed to update {kind} {name:?}"))]
    UpdateObject {
        source: UpdateError<Infallible>,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to update the status of OpsRequest {request:?}"))]
    UpdateOpsStatus {
        source: UpdateError<Infallible>,
        request: String,
    },

    #[snafu(display("failed to lock the cluster"))]
    Lock { source: lock::Error },

    #[snafu(display("failed to compute the config difference"))]
    DiffConfig { source: reconfigure::diff::Error },

    #[snafu(display("failed to convert the config files from or to JSON"))]
    SerializeConfig { source: serde_json::Error },
}

impl Error {
    /// Terminal errors fail the OpsRequest instead of being retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedOperation { .. }
                | Self::ClusterNotFound { .. }
                | Self::Validation { .. }
                | Self::ConflictingOperation { .. }
        )
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Static description of how an operation type interacts with the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpsBehaviour {
    /// Cluster phases the operation may start from.
    pub from_cluster_phases: BTreeSet<ClusterPhase>,
    /// The phase the cluster is in while the operation runs. Doubles as the lock key.
    pub to_cluster_phase: ClusterPhase,
    /// The operation restores the cluster phase on completion instead of the cluster controller.
    pub maintain_cluster_phase_by_self: bool,
    pub handler: OpsHandler,
}

impl OpsBehaviour {
    /// The built-in behaviour of an operation type.
    pub fn for_type(ops_type: OpsType) -> Self {
        let from_cluster_phases = BTreeSet::from([
            ClusterPhase::Running,
            ClusterPhase::Failed,
            ClusterPhase::Abnormal,
        ]);
        let (to_cluster_phase, handler) = match ops_type {
            OpsType::Upgrade => (ClusterPhase::Updating, OpsHandler::Upgrade),
            OpsType::VerticalScaling => {
                (ClusterPhase::VerticalScaling, OpsHandler::VerticalScaling)
            }
            OpsType::HorizontalScaling => {
                (ClusterPhase::HorizontalScaling, OpsHandler::HorizontalScaling)
            }
            OpsType::VolumeExpansion => {
                (ClusterPhase::VolumeExpanding, OpsHandler::VolumeExpansion)
            }
            OpsType::Restart => (ClusterPhase::Rebooting, OpsHandler::Restart),
            OpsType::Reconfigure => (ClusterPhase::Reconfiguring, OpsHandler::Reconfigure),
        };
        Self {
            from_cluster_phases,
            to_cluster_phase,
            maintain_cluster_phase_by_self: ops_type == OpsType::VolumeExpansion,
            handler,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("OpsRequest type {ops_type} is already registered"))]
    DuplicateOperation { ops_type: OpsType },
}

/// The immutable table of registered operations, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct OpsRegistry {
    behaviours: BTreeMap<OpsType, OpsBehaviour>,
}

impl OpsRegistry {
    pub fn builder() -> OpsRegistryBuilder {
        OpsRegistryBuilder::default()
    }

    /// A registry with the built-in behaviour of every operation type.
    pub fn with_default_operations() -> Self {
        Self {
            behaviours: <OpsType as strum::IntoEnumIterator>::iter()
                .map(|ops_type| (ops_type, OpsBehaviour::for_type(ops_type)))
                .collect(),
        }
    }

    pub fn get(&self, ops_type: OpsType) -> Option<&OpsBehaviour> {
        self.behaviours.get(&ops_type)
    }
}

#[derive(Debug, Default)]
pub struct OpsRegistryBuilder {
    behaviours: BTreeMap<OpsType, OpsBehaviour>,
}

impl OpsRegistryBuilder {
    pub fn register(
        mut self,
        ops_type: OpsType,
        behaviour: OpsBehaviour,
    ) -> Result<Self, RegistryError> {
        ensure!(
            !self.behaviours.contains_key(&ops_type),
            DuplicateOperationSnafu { ops_type }
        );
        self.behaviours.insert(ops_type, behaviour);
        Ok(self)
    }

    pub fn build(self) -> OpsRegistry {
        OpsRegistry {
            behaviours: self.behaviours,
        }
    }
}

/// Result of one reconciliation of a running OpsRequest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub phase: OpsPhase,
    pub progress: progress::Progress,
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub(crate) fn running(progress: progress::Progress, requeue_after: Duration) -> Self {
        Self {
            phase: OpsPhase::Running,
            progress,
            requeue_after: Some(requeue_after),
        }
    }

    pub(crate) fn done(phase: OpsPhase, progress: progress::Progress) -> Self {
        Self {
            phase,
            progress,
            requeue_after: None,
        }
    }
}

/// Collaborators and per-invocation state handed to the handlers.
pub(crate) struct OpsContext<'a, S> {
    pub store: &'a S,
    pub sidecar: &'a dyn SidecarClient,
    pub options: &'a EngineOptions,
    pub behaviour: &'a OpsBehaviour,
    pub now: Timestamp,
    /// Events produced by the handler, published by the manager once the status is persisted.
    pub events: Vec<OpsEvent>,
}

/// Dispatches the operation specific steps by operation type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpsHandler {
    Upgrade,
    VerticalScaling,
    HorizontalScaling,
    VolumeExpansion,
    Restart,
    Reconfigure,
}

impl OpsHandler {
    /// Checks the request against the live cluster without side effects.
    pub(crate) async fn validate<S: ObjectStore>(
        self,
        store: &S,
        request: &OpsRequest,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        match self {
            Self::Upgrade => upgrade::validate(store, request, cluster).await,
            Self::VerticalScaling => vertical_scaling::validate(request, cluster),
            Self::HorizontalScaling => horizontal_scaling::validate(request, cluster),
            Self::VolumeExpansion => volume_expansion::validate(store, request, cluster).await,
            Self::Restart => restart::validate(request, cluster),
            Self::Reconfigure => reconfiguring::validate(store, request, cluster).await,
        }
    }

    /// Snapshots the parts of the cluster the action is about to change.
    pub(crate) fn save_last_configuration(
        self,
        request: &OpsRequest,
        cluster: &Cluster,
    ) -> LastConfiguration {
        match self {
            Self::Upgrade => upgrade::save_last_configuration(cluster),
            Self::VerticalScaling => vertical_scaling::save_last_configuration(request, cluster),
            Self::HorizontalScaling => {
                horizontal_scaling::save_last_configuration(request, cluster)
            }
            Self::VolumeExpansion => volume_expansion::save_last_configuration(request, cluster),
            Self::Restart | Self::Reconfigure => LastConfiguration::default(),
        }
    }

    /// Applies the desired change. The only step allowed to change the cluster spec.
    pub(crate) async fn action<S: ObjectStore>(
        self,
        ctx: &mut OpsContext<'_, S>,
        request: &mut OpsRequest,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        match self {
            Self::Upgrade => upgrade::action(ctx, request, cluster).await,
            Self::VerticalScaling => vertical_scaling::action(ctx, request, cluster).await,
            Self::HorizontalScaling => horizontal_scaling::action(ctx, request, cluster).await,
            Self::VolumeExpansion => volume_expansion::action(ctx, request, cluster).await,
            Self::Restart => restart::action(ctx, request, cluster).await,
            Self::Reconfigure => reconfiguring::action(ctx, request, cluster).await,
        }
    }

    /// Inspects the current state of the cluster and reports the progress of the request.
    pub(crate) async fn reconcile_action<S: ObjectStore>(
        self,
        ctx: &mut OpsContext<'_, S>,
        request: &mut OpsRequest,
        cluster: &Cluster,
    ) -> Result<ReconcileOutcome, Error> {
        match self {
            Self::Upgrade => Ok(component::reconcile_with_cluster_phase(ctx, request, cluster)),
            Self::VerticalScaling => {
                component::reconcile_component_pods(ctx, request, cluster, "vertical scale").await
            }
            Self::HorizontalScaling => {
                component::reconcile_component_pods(ctx, request, cluster, "horizontal scale")
                    .await
            }
            Self::VolumeExpansion => volume_expansion::reconcile_action(ctx, request, cluster).await,
            Self::Restart => {
                component::reconcile_component_pods(ctx, request, cluster, "restart").await
            }
            Self::Reconfigure => reconfiguring::reconcile_action(ctx, request, cluster).await,
        }
    }
}

/// Fails validation if any of the named components does not exist in the cluster.
pub(crate) fn ensure_components_exist<'a>(
    cluster: &Cluster,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let missing: Vec<String> = names
        .into_iter()
        .filter(|name| cluster.component(name).is_none())
        .map(str::to_owned)
        .collect();
    ensure!(
        missing.is_empty(),
        ComponentsNotFoundSnafu { names: missing }
    );
    Ok(())
}

/// Parses and compares two quantities, reporting the one that is malformed.
pub(crate) fn compare_quantities(left: &str, right: &str) -> Result<Ordering, ValidationError> {
    let parse = |value: &str| {
        Quantity::from_str(value).context(InvalidQuantitySnafu { value })
    };
    Ok(parse(left)?.value().total_cmp(&parse(right)?.value()))
}

/// Applies `mutate` to the spec of the cluster and writes it if it reports a change.
pub(crate) async fn update_cluster_spec<S, F>(
    ctx: &OpsContext<'_, S>,
    cluster: &Cluster,
    mut mutate: F,
) -> Result<Cluster, Error>
where
    S: ObjectStore,
    F: FnMut(&mut Cluster) -> bool + Send,
{
    let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = cluster.name_any();
    let (cluster, ()) = update_with_retry::<_, Cluster, Infallible, _, _>(
        ctx.store,
        &namespace,
        &name,
        UpdateTarget::Object,
        ctx.options.conflict_retries,
        |cluster| {
            Ok(if mutate(cluster) {
                Mutation::Changed(())
            } else {
                Mutation::Unchanged(())
            })
        },
    )
    .await
    .context(UpdateObjectSnafu {
        kind: "Cluster",
        name,
    })?;
    Ok(cluster)
}
