//! Progress strategies shared by several operation types.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};

use super::{
    Error, ListObjectsSnafu, ObjectHasNoNamespaceSnafu, OpsContext, ReconcileOutcome,
    progress::{
        Progress, failed_message, object_key, processing_message, set_progress_detail,
        succeed_message,
    },
};
use crate::{
    client::ObjectStore,
    constants::{COMPONENT_NAME_KEY, K8S_APP_INSTANCE_KEY},
    crd::{
        Cluster, ClusterPhase, ComponentPhase, OpsPhase, OpsRequest, ProgressDetail,
        ProgressStatus,
    },
    pod_utils::{created_before, is_pod_available},
};

/// Label selector matching the objects of one component of a cluster.
pub(super) fn component_selector(cluster: &Cluster, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (K8S_APP_INSTANCE_KEY.to_owned(), cluster.name_any()),
        (COMPONENT_NAME_KEY.to_owned(), component.to_owned()),
    ])
}

/// Why a component failed, as reported by the cluster controller.
pub(super) fn component_failure_message(cluster: &Cluster, component: &str) -> String {
    cluster
        .status
        .as_ref()
        .and_then(|status| status.components.get(component))
        .map(|status| {
            status
                .message
                .clone()
                .unwrap_or_else(|| format!("component is {}", status.phase))
        })
        .unwrap_or_default()
}

/// Tracks every pod of the components named in the request.
///
/// The request succeeds once every named component completed and all declared replicas are
/// available, and fails when a component failed after the cluster controller observed the change.
/// Nothing is decided while the cluster is still in the phase of the operation.
pub(super) async fn reconcile_component_pods<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
    verb: &str,
) -> Result<ReconcileOutcome, Error> {
    let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let start = request
        .status
        .as_ref()
        .and_then(|status| status.start_timestamp.as_ref())
        .map(|time| time.0);
    let cluster_generation = request
        .status
        .as_ref()
        .and_then(|status| status.cluster_generation);
    let names: Vec<String> = request
        .component_names()
        .into_iter()
        .map(str::to_owned)
        .collect();

    let mut progress = Progress::default();
    let mut any_failed = false;
    let mut all_completed = true;
    for name in &names {
        let Some(component) = cluster.component(name) else {
            continue;
        };
        let phase = cluster.component_phase(name);
        let completed = phase.is_some_and(ComponentPhase::is_completed);
        let failed = phase.is_some_and(ComponentPhase::is_failed);
        any_failed |= failed;
        all_completed &= completed;

        let pods: Vec<Pod> = ctx
            .store
            .list(&namespace, &component_selector(cluster, name))
            .await
            .context(ListObjectsSnafu { kind: "Pod" })?;

        let status = request
            .status_mut()
            .components
            .entry(name.clone())
            .or_default();
        status.phase = phase;

        let mut succeed = 0;
        for pod in pods
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        {
            let key = object_key("Pod", &pod.name_any());
            let detail = if start.is_some_and(|start| created_before(pod, start)) && !completed {
                ProgressDetail::new(&key, ProgressStatus::Pending)
            } else if is_pod_available(pod, component.min_ready_seconds, ctx.now) {
                succeed += 1;
                ProgressDetail::new(&key, ProgressStatus::Succeed)
                    .with_message(succeed_message(verb, &key, name))
            } else if failed {
                let reason = component_failure_message(cluster, name);
                ProgressDetail::new(&key, ProgressStatus::Failed)
                    .with_message(failed_message(verb, &key, name, &reason))
            } else {
                ProgressDetail::new(&key, ProgressStatus::Processing)
                    .with_message(processing_message(verb, &key, name))
            };
            if let Some(event) = set_progress_detail(&mut status.progress_details, detail, ctx.now)
            {
                ctx.events.push(event);
            }
        }
        progress = progress + Progress::new(succeed, component.replicas);
    }

    let requeue = ctx.options.requeue_interval;
    if cluster.phase() == Some(ctx.behaviour.to_cluster_phase) {
        return Ok(ReconcileOutcome::running(progress, requeue));
    }
    if any_failed && cluster.has_observed(cluster_generation) {
        return Ok(ReconcileOutcome::done(OpsPhase::Failed, progress));
    }
    if !all_completed || !progress.is_complete() {
        return Ok(ReconcileOutcome::running(progress, requeue));
    }
    Ok(ReconcileOutcome::done(OpsPhase::Succeed, progress))
}

/// Derives the outcome from the phase of the whole cluster.
pub(super) fn reconcile_with_cluster_phase<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> ReconcileOutcome {
    let cluster_generation = request
        .status
        .as_ref()
        .and_then(|status| status.cluster_generation);

    let mut progress = Progress::default();
    let status = request.status_mut();
    for component in &cluster.spec.components {
        let phase = cluster.component_phase(&component.name);
        status
            .components
            .entry(component.name.clone())
            .or_default()
            .phase = phase;
        let done = phase.is_some_and(|phase| phase.is_completed() && !phase.is_failed());
        progress = progress + Progress::new(i32::from(done), 1);
    }

    let observed = cluster.has_observed(cluster_generation);
    match cluster.phase() {
        Some(phase) if phase == ctx.behaviour.to_cluster_phase => {
            ReconcileOutcome::running(progress, ctx.options.requeue_interval)
        }
        Some(ClusterPhase::Running) if observed => {
            ReconcileOutcome::done(OpsPhase::Succeed, progress)
        }
        Some(ClusterPhase::Failed | ClusterPhase::Abnormal) if observed => {
            ReconcileOutcome::done(OpsPhase::Failed, progress)
        }
        _ => ReconcileOutcome::running(progress, ctx.options.requeue_interval),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;

    use super::*;
    use crate::{
        crd::{OpsType, ops_request::ComponentOps},
        ops::{
            OpsBehaviour,
            test_support::{Harness, NOW, cluster, now, request, set_phases, spec},
        },
        test::{PodBuilder, ts},
    };

    fn restart_request() -> OpsRequest {
        let mut spec = spec(OpsType::Restart);
        spec.restart = vec![ComponentOps {
            component_name: "mysql".to_owned(),
        }];
        let mut request = request("restart", spec);
        let status = request.status_mut();
        status.phase = OpsPhase::Running;
        status.start_timestamp = Some(Time(now()));
        status.cluster_generation = Some(1);
        request
    }

    /// Three pods recreated after the restart started, ready for a while.
    fn harness_with_recreated_pods() -> Harness {
        let harness = Harness::default();
        for ordinal in 0..3 {
            harness.store.insert(
                &PodBuilder::new("mycluster", "mysql", ordinal)
                    .created_at(ts(NOW + 10))
                    .ready_since(ts(NOW + 10))
                    .build(),
            );
        }
        harness
    }

    #[rstest]
    #[case::component_still_rebooting(ClusterPhase::Abnormal, ComponentPhase::Rebooting)]
    #[case::component_still_updating(ClusterPhase::Running, ComponentPhase::Updating)]
    #[tokio::test]
    async fn ready_pods_do_not_succeed_before_the_component_completed(
        #[case] cluster_phase: ClusterPhase,
        #[case] component_phase: ComponentPhase,
    ) {
        let harness = harness_with_recreated_pods();
        let behaviour = OpsBehaviour::for_type(OpsType::Restart);
        let mut request = restart_request();
        let mut cluster = cluster();
        set_phases(&mut cluster, cluster_phase, component_phase);

        let outcome = reconcile_component_pods(
            &mut harness.ctx(&behaviour, ts(NOW + 60)),
            &mut request,
            &cluster,
            "restart",
        )
        .await
        .unwrap();

        assert_eq!(outcome.phase, OpsPhase::Running);
        assert_eq!(outcome.progress.to_string(), "3/3");
        assert_eq!(
            request.status.unwrap().components["mysql"].phase,
            Some(component_phase)
        );
    }

    #[tokio::test]
    async fn succeeds_once_the_component_completed() {
        let harness = harness_with_recreated_pods();
        let behaviour = OpsBehaviour::for_type(OpsType::Restart);
        let mut request = restart_request();

        let outcome = reconcile_component_pods(
            &mut harness.ctx(&behaviour, ts(NOW + 60)),
            &mut request,
            &cluster(),
            "restart",
        )
        .await
        .unwrap();

        assert_eq!(outcome.phase, OpsPhase::Succeed);
        assert_eq!(outcome.requeue_after, None);
    }
}
