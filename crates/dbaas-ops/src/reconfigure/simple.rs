use std::convert::Infallible;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use snafu::ResultExt;

use super::{ExecStatus, PatchWorkloadSnafu, ReconfigureOutcome, ReconfigureParams};
use crate::{
    client::{Mutation, ObjectStore, UpdateTarget, update_with_retry},
    constants::config_restart_key,
};

/// Restarts all pods of the component at once by changing its pod template.
pub(super) async fn upgrade<S: ObjectStore>(
    params: &ReconfigureParams<'_, S>,
) -> Result<ReconfigureOutcome, super::Error> {
    if let Some(outcome) = params.not_supported() {
        return Ok(outcome);
    }

    let workload = params.cluster.workload_name(&params.component.name);
    let key = config_restart_key(&params.config_spec.name);
    let (_, has_template) = update_with_retry::<_, StatefulSet, Infallible, _, _>(
        params.store,
        &params.namespace(),
        &workload,
        UpdateTarget::Object,
        params.conflict_retries,
        |sts| {
            let Some(spec) = sts.spec.as_mut() else {
                return Ok(Mutation::Unchanged(false));
            };
            let annotations = spec
                .template
                .metadata
                .get_or_insert_with(Default::default)
                .annotations
                .get_or_insert_with(Default::default);
            if annotations.get(&key).map(String::as_str) == Some(params.target_version) {
                return Ok(Mutation::Unchanged(true));
            }
            annotations.insert(key.clone(), params.target_version.to_owned());
            Ok(Mutation::Changed(true))
        },
    )
    .await
    .context(PatchWorkloadSnafu {
        workload: &workload,
    })?;
    if !has_template {
        tracing::warn!(workload, "workload has no spec yet, cannot restart its pods");
        return Ok(ReconfigureOutcome::new(
            ExecStatus::Retry,
            0,
            params.component.replicas,
        ));
    }

    tracing::info!(
        workload,
        cluster = %params.cluster.name_any(),
        "restarted workload with new config"
    );
    Ok(ReconfigureOutcome::new(
        ExecStatus::None,
        usize::try_from(params.component.replicas).unwrap_or_default(),
        params.component.replicas,
    ))
}
