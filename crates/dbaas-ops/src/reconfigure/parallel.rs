use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;

use super::{ExecStatus, ReconfigureOutcome, ReconfigureParams};
use crate::client::ObjectStore;

/// Restarts the containers of every outdated pod concurrently.
///
/// Pods are labeled with the new version only after all stop calls of this step succeeded. A
/// failed step leaves the remaining pods unlabeled, so the next invocation picks them up again.
/// The step is complete once as many pods as the component has replicas carry the new version.
pub(super) async fn upgrade<S: ObjectStore>(
    params: &ReconfigureParams<'_, S>,
) -> Result<ReconfigureOutcome, super::Error> {
    if let Some(outcome) = params.not_supported() {
        return Ok(outcome);
    }
    if params.config_spec.container_names.is_empty() {
        tracing::warn!(
            config_spec = params.config_spec.name,
            "config spec names no containers to restart"
        );
        return Ok(ReconfigureOutcome::new(
            ExecStatus::Failed,
            0,
            params.component.replicas,
        ));
    }

    let pods = params.list_pods().await?;
    let expected = params.component.replicas;
    let outdated: Vec<&Pod> = pods.iter().filter(|pod| !params.is_updated(pod)).collect();
    if !outdated.is_empty() {
        join_all(outdated.iter().map(|pod| params.stop_containers(pod)))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()?;

        for pod in &outdated {
            params.label_pod(pod).await?;
        }
    }

    let status = if i32::try_from(pods.len()).unwrap_or(i32::MAX) < expected {
        tracing::debug!(
            observed = pods.len(),
            expected,
            "not all pods of the component exist yet"
        );
        ExecStatus::Retry
    } else {
        ExecStatus::None
    };
    Ok(ReconfigureOutcome::new(status, pods.len(), expected))
}
