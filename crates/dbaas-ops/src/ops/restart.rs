use std::convert::Infallible;

use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::PodTemplateSpec,
};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, ensure};

use super::{
    EmptyPayloadSnafu, Error, ObjectHasNoNamespaceSnafu, OpsContext, UpdateObjectSnafu,
    ensure_components_exist,
};
use crate::{
    client::{Mutation, NamespacedObject, ObjectStore, UpdateTarget, update_with_retry},
    constants::RESTART_ANNOTATION_KEY,
    crd::{Cluster, OpsRequest, WorkloadType},
};

pub(super) fn validate(request: &OpsRequest, cluster: &Cluster) -> Result<(), Error> {
    ensure!(
        !request.spec.restart.is_empty(),
        EmptyPayloadSnafu { field: "restart" }
    );
    ensure_components_exist(cluster, request.component_names())?;
    Ok(())
}

/// Bumps the restart annotation in the pod template of every named component.
pub(super) async fn action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let restarted_at = request
        .status
        .as_ref()
        .and_then(|status| status.start_timestamp.as_ref())
        .map_or(ctx.now, |time| time.0)
        .to_string();

    for component in &request.spec.restart {
        let Some(spec) = cluster.component(&component.component_name) else {
            continue;
        };
        let workload = cluster.workload_name(&spec.name);
        if spec.workload_type == WorkloadType::Stateless {
            annotate_pod_template::<_, Deployment>(
                ctx.store,
                &namespace,
                &workload,
                |deployment| deployment.spec.as_mut().map(|spec| &mut spec.template),
                RESTART_ANNOTATION_KEY,
                &restarted_at,
                ctx.options.conflict_retries,
            )
            .await?;
        } else {
            annotate_pod_template::<_, StatefulSet>(
                ctx.store,
                &namespace,
                &workload,
                |sts| sts.spec.as_mut().map(|spec| &mut spec.template),
                RESTART_ANNOTATION_KEY,
                &restarted_at,
                ctx.options.conflict_retries,
            )
            .await?;
        }
        tracing::info!(workload, "restarting component");
    }
    Ok(())
}

/// Sets `key=value` in the pod template annotations of a workload, which rolls its pods.
async fn annotate_pod_template<S, K>(
    store: &S,
    namespace: &str,
    name: &str,
    template: fn(&mut K) -> Option<&mut PodTemplateSpec>,
    key: &str,
    value: &str,
    max_attempts: usize,
) -> Result<(), Error>
where
    S: ObjectStore,
    K: NamespacedObject,
{
    update_with_retry::<_, K, Infallible, _, _>(
        store,
        namespace,
        name,
        UpdateTarget::Object,
        max_attempts,
        |workload| {
            let Some(template) = template(workload) else {
                return Ok(Mutation::Unchanged(()));
            };
            let annotations = template
                .metadata
                .get_or_insert_with(Default::default)
                .annotations
                .get_or_insert_with(Default::default);
            if annotations.get(key).map(String::as_str) == Some(value) {
                return Ok(Mutation::Unchanged(()));
            }
            annotations.insert(key.to_owned(), value.to_owned());
            Ok(Mutation::Changed(()))
        },
    )
    .await
    .context(UpdateObjectSnafu {
        kind: K::kind(&()).to_string(),
        name,
    })?;
    Ok(())
}
