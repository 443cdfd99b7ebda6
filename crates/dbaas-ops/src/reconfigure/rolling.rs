use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::{ExecStatus, ReconfigureOutcome, ReconfigureParams};
use crate::{
    client::ObjectStore,
    pod_utils::is_pod_available,
    reconfigure::orderer::{RolePriorityMap, sort_pods},
};

/// Moves exactly one pod to the new version per invocation, in role priority order.
///
/// The next pod is only touched once every updated pod has been ready for the component's
/// `min_ready_seconds`, so the leader is restarted last and only after all others are healthy.
pub(super) async fn upgrade<S: ObjectStore>(
    params: &ReconfigureParams<'_, S>,
) -> Result<ReconfigureOutcome, super::Error> {
    if let Some(outcome) = params.not_supported() {
        return Ok(outcome);
    }
    let replicas = params.component.replicas;
    if params.config_spec.container_names.is_empty() {
        tracing::warn!(
            config_spec = params.config_spec.name,
            "config spec names no containers to restart"
        );
        return Ok(ReconfigureOutcome::new(ExecStatus::Failed, 0, replicas));
    }

    let mut pods = params.list_pods().await?;
    let available = |pod: &Pod| {
        is_pod_available(pod, params.component.min_ready_seconds, params.now)
    };
    let settled = pods
        .iter()
        .filter(|&pod| params.is_updated(pod) && available(pod))
        .count();

    if i32::try_from(pods.len()).ok() != Some(replicas) {
        tracing::debug!(
            pods = pods.len(),
            replicas,
            "waiting for the pod count to match the desired replicas"
        );
        return Ok(ReconfigureOutcome::new(ExecStatus::Retry, settled, replicas));
    }

    if let Some(pod) = pods
        .iter()
        .find(|&pod| params.is_updated(pod) && !available(pod))
    {
        tracing::debug!(
            pod = pod.name_any(),
            "waiting for updated pod to become available"
        );
        return Ok(ReconfigureOutcome::new(ExecStatus::Retry, settled, replicas));
    }

    sort_pods(&mut pods, &RolePriorityMap::from_roles(&params.component.roles));
    let Some(next) = pods.iter().find(|pod| !params.is_updated(pod)) else {
        return Ok(ReconfigureOutcome::new(ExecStatus::None, settled, replicas));
    };

    params.stop_containers(next).await?;
    params.label_pod(next).await?;
    tracing::info!(pod = next.name_any(), "restarted pod with new config");
    Ok(ReconfigureOutcome::new(ExecStatus::Retry, settled, replicas))
}
