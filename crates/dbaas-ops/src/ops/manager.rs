//! Drives OpsRequests through their lifecycle.

use std::{convert::Infallible, sync::Arc};

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info, warn};

use super::{
    ClusterNotFoundSnafu, ClusterPhaseForbiddenSnafu, ConflictingOperationSnafu, Error,
    GetObjectSnafu, LockSnafu, ObjectHasNoNamespaceSnafu, OpsBehaviour, OpsContext, OpsRegistry,
    ReconcileOutcome, UnsupportedOperationSnafu, UpdateOpsStatusSnafu, UpdateObjectSnafu,
    lock::{self, LockTable},
    progress::Progress,
};
use crate::{
    cli::EngineOptions,
    client::{Mutation, ObjectStore, UpdateTarget, update_with_retry},
    crd::{Cluster, OpsPhase, OpsRequest, ops_request::OpsRequestStatus},
    logging::k8s_events::{EventRecorder, OpsEvent},
    reconfigure::sidecar::SidecarClient,
    status::condition::{
        OpsCondition, REASON_CLUSTER_NOT_FOUND, REASON_CONFLICTING_OPERATION, REASON_OPS_FAILED,
        REASON_OPS_TYPE_NOT_SUPPORTED, REASON_VALIDATE_FAILED, set_condition,
    },
};

/// Entry point of the engine, invoked by the OpsRequest controller.
///
/// [`OpsManager::do_action`] starts a pending request and [`OpsManager::reconcile`] tracks a
/// running one until it is done. Both perform a single bounded step per call and are safe to
/// repeat.
pub struct OpsManager<S> {
    registry: Arc<OpsRegistry>,
    store: S,
    sidecar: Arc<dyn SidecarClient>,
    events: Arc<dyn EventRecorder>,
    options: EngineOptions,
}

impl<S: ObjectStore> OpsManager<S> {
    pub fn new(
        registry: Arc<OpsRegistry>,
        store: S,
        sidecar: Arc<dyn SidecarClient>,
        events: Arc<dyn EventRecorder>,
        options: EngineOptions,
    ) -> Self {
        Self {
            registry,
            store,
            sidecar,
            events,
            options,
        }
    }

    pub fn registry(&self) -> &OpsRegistry {
        &self.registry
    }

    /// Checks a request against the live cluster without changing anything.
    pub async fn validate(&self, request: &OpsRequest) -> Result<(), Error> {
        let behaviour = self.behaviour(request)?;
        let namespace = request.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let cluster = self
            .get_cluster(&namespace, &request.spec.cluster_ref)
            .await?;
        self.validate_against(behaviour, request, &cluster).await
    }

    /// Rejects spec edits of requests that already started.
    pub fn validate_update(
        &self,
        old: &OpsRequest,
        new: &OpsRequest,
    ) -> Result<(), crate::crd::ops_request::UpdateError> {
        new.validate_update(old)
    }

    /// Starts a pending request: validates it, locks the cluster and applies the change.
    ///
    /// Returns the persisted request. Terminal failures are persisted as a failed request before
    /// the error is returned, all other errors leave the request pending so the call can be
    /// retried.
    #[tracing::instrument(
        skip(self, request),
        fields(request = %request.name_any(), ops_type = %request.spec.type_)
    )]
    pub async fn do_action(&self, request: &OpsRequest, now: Timestamp) -> Result<OpsRequest, Error> {
        if request.phase() != OpsPhase::Pending {
            debug!(phase = %request.phase(), "request already started");
            return Ok(request.clone());
        }

        let mut request = request.clone();
        let mut events = Vec::new();
        match self.start(&mut request, now, &mut events).await {
            Ok(cluster) => {
                let persisted = self.persist_status(&request).await?;
                self.publish(&persisted, events).await;
                self.events
                    .publish(
                        &cluster.object_ref(&()),
                        OpsEvent::normal(
                            request.spec.type_.to_string(),
                            format!(
                                "Start to process the {} opsRequest {:?} in Cluster: {}",
                                request.spec.type_,
                                request.name_any(),
                                cluster.name_any()
                            ),
                        ),
                    )
                    .await;
                info!("started OpsRequest");
                Ok(persisted)
            }
            Err(err) if err.is_terminal() => {
                warn!(error = &err as &dyn std::error::Error, "OpsRequest failed to start");
                let status = request.status_mut();
                status.phase = OpsPhase::Failed;
                status.completion_timestamp = Some(Time(now));
                record_condition(status, failure_condition(&err), now, &mut events);
                self.release_failed_start(&request).await?;
                let persisted = self.persist_status(&request).await?;
                self.publish(&persisted, events).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn start(
        &self,
        request: &mut OpsRequest,
        now: Timestamp,
        events: &mut Vec<OpsEvent>,
    ) -> Result<Cluster, Error> {
        let ops_type = request.spec.type_;
        let name = request.name_any();
        let behaviour = self.behaviour(request)?;
        let namespace = request.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let cluster_name = request.spec.cluster_ref.clone();
        let cluster = self.get_cluster(&namespace, &cluster_name).await?;
        self.validate_against(behaviour, request, &cluster).await?;

        let last_configuration = behaviour
            .handler
            .save_last_configuration(request, &cluster);
        let generation = request.metadata.generation;
        let status = request.status_mut();
        status.phase = OpsPhase::Running;
        status.observed_generation = generation;
        status.start_timestamp = Some(Time(now));
        status.last_configuration = last_configuration;
        record_condition(status, OpsCondition::validated(&name), now, events);
        record_condition(
            status,
            OpsCondition::started(ops_type, &cluster_name),
            now,
            events,
        );

        let cluster = lock::acquire(
            &self.store,
            &namespace,
            &cluster_name,
            behaviour.to_cluster_phase,
            &name,
            self.options.conflict_retries,
        )
        .await
        .map_err(|source| match source.conflict() {
            Some((phase, holder)) => ConflictingOperationSnafu { phase, holder }.build(),
            None => Error::Lock { source },
        })?;

        let mut ctx = self.context(behaviour, now);
        behaviour.handler.action(&mut ctx, request, &cluster).await?;
        events.append(&mut ctx.events);

        let to_phase = behaviour.to_cluster_phase;
        let (cluster, ()) = update_with_retry::<_, Cluster, Infallible, _, _>(
            &self.store,
            &namespace,
            &cluster_name,
            UpdateTarget::Status,
            self.options.conflict_retries,
            |cluster| {
                let status = cluster.status.get_or_insert_with(Default::default);
                if status.phase == Some(to_phase) {
                    return Ok(Mutation::Unchanged(()));
                }
                status.phase = Some(to_phase);
                Ok(Mutation::Changed(()))
            },
        )
        .await
        .context(UpdateObjectSnafu {
            kind: "Cluster",
            name: &cluster_name,
        })?;
        request.status_mut().cluster_generation = cluster.metadata.generation;
        Ok(cluster)
    }

    /// Runs one progress check of a running request and completes it when it is done.
    #[tracing::instrument(
        skip(self, request),
        fields(request = %request.name_any(), ops_type = %request.spec.type_)
    )]
    pub async fn reconcile(
        &self,
        request: &OpsRequest,
        now: Timestamp,
    ) -> Result<ReconcileOutcome, Error> {
        if request.phase() != OpsPhase::Running {
            return Ok(ReconcileOutcome::done(request.phase(), Progress::default()));
        }

        let mut request = request.clone();
        let name = request.name_any();
        let behaviour = self.behaviour(&request)?;
        let namespace = request.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let cluster_name = request.spec.cluster_ref.clone();
        let mut events = Vec::new();
        let mut failure = None;

        let outcome = match self.find_cluster(&namespace, &cluster_name).await? {
            Some(cluster) => {
                let mut ctx = self.context(behaviour, now);
                let outcome = behaviour
                    .handler
                    .reconcile_action(&mut ctx, &mut request, &cluster)
                    .await?;
                events.append(&mut ctx.events);
                outcome
            }
            None => {
                warn!(cluster = %cluster_name, "cluster of running OpsRequest is gone");
                let err = ClusterNotFoundSnafu {
                    cluster: &cluster_name,
                }
                .build();
                failure = Some(failure_condition(&err));
                ReconcileOutcome::done(OpsPhase::Failed, Progress::default())
            }
        };

        let status = request.status_mut();
        status.progress = outcome.progress.to_string();
        status.phase = outcome.phase;
        if outcome.phase.is_terminal() {
            status.completion_timestamp = Some(Time(now));
            let condition = match failure {
                Some(condition) => condition,
                None if outcome.phase == OpsPhase::Succeed => OpsCondition::succeed(&name),
                None => OpsCondition::failed(
                    REASON_OPS_FAILED,
                    failure_message(status, &name, &cluster_name),
                ),
            };
            record_condition(status, condition, now, &mut events);

            lock::release(
                &self.store,
                &namespace,
                &cluster_name,
                behaviour.to_cluster_phase,
                &name,
                behaviour.maintain_cluster_phase_by_self,
                self.options.conflict_retries,
            )
            .await
            .context(LockSnafu)?;
            info!(phase = %outcome.phase, progress = %outcome.progress, "OpsRequest completed");
        }

        let persisted = self.persist_status(&request).await?;
        self.publish(&persisted, events).await;
        Ok(outcome)
    }

    fn behaviour(&self, request: &OpsRequest) -> Result<&OpsBehaviour, Error> {
        let ops_type = request.spec.type_;
        self.registry
            .get(ops_type)
            .context(UnsupportedOperationSnafu { ops_type })
    }

    fn context<'a>(&'a self, behaviour: &'a OpsBehaviour, now: Timestamp) -> OpsContext<'a, S> {
        OpsContext {
            store: &self.store,
            sidecar: &*self.sidecar,
            options: &self.options,
            behaviour,
            now,
            events: Vec::new(),
        }
    }

    async fn find_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        self.store
            .get::<Cluster>(namespace, name)
            .await
            .context(GetObjectSnafu {
                kind: "Cluster",
                name,
            })
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Cluster, Error> {
        self.find_cluster(namespace, name)
            .await?
            .context(ClusterNotFoundSnafu { cluster: name })
    }

    /// Cluster phase check plus the checks of the operation type.
    ///
    /// A request that already holds its lock is retrying a start whose action was applied. The
    /// cluster may have left the source phase and the payload checks may no longer hold against
    /// the changed cluster, so both are skipped.
    async fn validate_against(
        &self,
        behaviour: &OpsBehaviour,
        request: &OpsRequest,
        cluster: &Cluster,
    ) -> Result<(), Error> {
        if holds_lock(behaviour, request, cluster) {
            debug!("request already holds the cluster lock");
            return Ok(());
        }
        let phase = cluster.phase();
        ensure!(
            phase.is_some_and(|phase| behaviour.from_cluster_phases.contains(&phase)),
            ClusterPhaseForbiddenSnafu {
                ops_type: request.spec.type_,
                phase: phase.map(|phase| phase.to_string()).unwrap_or_default(),
            }
        );
        behaviour
            .handler
            .validate(&self.store, request, cluster)
            .await
    }

    /// Releases the lock of a request that failed to start, if it got that far.
    async fn release_failed_start(&self, request: &OpsRequest) -> Result<(), Error> {
        let (Ok(behaviour), Some(namespace)) = (self.behaviour(request), request.namespace())
        else {
            return Ok(());
        };
        lock::release(
            &self.store,
            &namespace,
            &request.spec.cluster_ref,
            behaviour.to_cluster_phase,
            &request.name_any(),
            behaviour.maintain_cluster_phase_by_self,
            self.options.conflict_retries,
        )
        .await
        .context(LockSnafu)
    }

    /// Writes the status of `request` unless the stored one is identical.
    async fn persist_status(&self, request: &OpsRequest) -> Result<OpsRequest, Error> {
        let namespace = request.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let name = request.name_any();
        let status = request.status.clone();
        let (persisted, ()) = update_with_retry::<_, OpsRequest, Infallible, _, _>(
            &self.store,
            &namespace,
            &name,
            UpdateTarget::Status,
            self.options.conflict_retries,
            |stored| {
                if stored.status == status {
                    return Ok(Mutation::Unchanged(()));
                }
                stored.status.clone_from(&status);
                Ok(Mutation::Changed(()))
            },
        )
        .await
        .context(UpdateOpsStatusSnafu { request: &name })?;
        Ok(persisted)
    }

    async fn publish(&self, request: &OpsRequest, events: Vec<OpsEvent>) {
        let reference = request.object_ref(&());
        for event in events {
            self.events.publish(&reference, event).await;
        }
    }
}

fn holds_lock(behaviour: &OpsBehaviour, request: &OpsRequest, cluster: &Cluster) -> bool {
    LockTable::from_cluster(cluster).is_ok_and(|table| {
        table.holder(behaviour.to_cluster_phase) == Some(request.name_any().as_str())
    })
}

/// Sets `condition` and queues an event for it if it changed anything.
fn record_condition(
    status: &mut OpsRequestStatus,
    condition: OpsCondition,
    now: Timestamp,
    events: &mut Vec<OpsEvent>,
) {
    let reason = condition.reason.clone().unwrap_or_default();
    let message = condition.message.clone().unwrap_or_default();
    let event = if condition.is_failure() {
        OpsEvent::warning(reason, message)
    } else {
        OpsEvent::normal(reason, message)
    };
    if set_condition(&mut status.conditions, condition, now) {
        events.push(event);
    }
}

fn failure_condition(err: &Error) -> OpsCondition {
    match err {
        Error::UnsupportedOperation { .. } => {
            OpsCondition::failed(REASON_OPS_TYPE_NOT_SUPPORTED, err.to_string())
        }
        Error::ClusterNotFound { .. } => {
            OpsCondition::failed(REASON_CLUSTER_NOT_FOUND, err.to_string())
        }
        Error::Validation { source } => {
            OpsCondition::failed(REASON_VALIDATE_FAILED, source.to_string())
        }
        Error::ConflictingOperation { .. } => {
            OpsCondition::failed(REASON_CONFLICTING_OPERATION, err.to_string())
        }
        _ => OpsCondition::failed(
            REASON_OPS_FAILED,
            snafu::Report::from_error(err).to_string(),
        ),
    }
}

fn failure_message(status: &OpsRequestStatus, name: &str, cluster: &str) -> String {
    status
        .reconfiguring_status
        .as_ref()
        .and_then(|reconfiguring| reconfiguring.message.clone())
        .unwrap_or_else(|| {
            format!(
                "Failed to process OpsRequest: {name} in Cluster: {cluster}, more detailed \
                 information in status.components"
            )
        })
}
