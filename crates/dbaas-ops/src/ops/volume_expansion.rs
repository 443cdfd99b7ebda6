use std::cmp::Ordering;

use k8s_openapi::api::{core::v1::PersistentVolumeClaim, storage::v1::StorageClass};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, ensure};

use super::{
    EmptyPayloadSnafu, Error, GetObjectSnafu, ListObjectsSnafu, ObjectHasNoNamespaceSnafu,
    OpsContext, ReconcileOutcome, StorageClassNotExpandableSnafu, StorageClassNotFoundSnafu,
    StorageShrinkSnafu, VolumeClaimTemplateNotFoundSnafu, compare_quantities,
    component::component_selector,
    ensure_components_exist,
    progress::{
        Progress, failed_message, find_progress_detail, object_key, processing_message,
        set_progress_detail, succeed_message,
    },
    update_cluster_spec,
};
use crate::{
    client::ObjectStore,
    constants::VOLUME_CLAIM_TEMPLATE_KEY,
    crd::{
        Cluster, OpsPhase, OpsRequest, ProgressDetail, ProgressStatus,
        ops_request::{LastComponentConfiguration, LastConfiguration},
    },
    quantity,
    reconfigure::orderer::pod_ordinal,
};

const VERB: &str = "expand volume";
const STORAGE: &str = "storage";

pub(super) async fn validate<S: ObjectStore>(
    store: &S,
    request: &OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let expansions = &request.spec.volume_expansion;
    ensure!(
        !expansions.is_empty(),
        EmptyPayloadSnafu {
            field: "volumeExpansion"
        }
    );
    ensure_components_exist(cluster, request.component_names())?;

    for expansion in expansions {
        let Some(component) = cluster.component(&expansion.component_name) else {
            continue;
        };
        for requested in &expansion.volume_claim_templates {
            let current = component
                .volume_claim_template(&requested.name)
                .context(VolumeClaimTemplateNotFoundSnafu {
                    component: &component.name,
                    name: &requested.name,
                })?;
            ensure!(
                compare_quantities(&requested.storage, &current.storage)? != Ordering::Less,
                StorageShrinkSnafu {
                    component: &component.name,
                    name: &requested.name,
                    current: &current.storage,
                    requested: &requested.storage,
                }
            );

            if let Some(class_name) = &current.storage_class_name {
                let class = store
                    .get_cluster_scoped::<StorageClass>(class_name)
                    .await
                    .context(GetObjectSnafu {
                        kind: "StorageClass",
                        name: class_name,
                    })?
                    .context(StorageClassNotFoundSnafu { name: class_name })?;
                ensure!(
                    class.allow_volume_expansion == Some(true),
                    StorageClassNotExpandableSnafu { name: class_name }
                );
            }
        }
    }
    Ok(())
}

pub(super) fn save_last_configuration(request: &OpsRequest, cluster: &Cluster) -> LastConfiguration {
    let components = request
        .spec
        .volume_expansion
        .iter()
        .filter_map(|expansion| {
            let component = cluster.component(&expansion.component_name)?;
            let volume_claim_templates = expansion
                .volume_claim_templates
                .iter()
                .filter_map(|requested| component.volume_claim_template(&requested.name))
                .map(|vct| (vct.name.clone(), vct.storage.clone()))
                .collect();
            Some((component.name.clone(), LastComponentConfiguration {
                volume_claim_templates,
                ..LastComponentConfiguration::default()
            }))
        })
        .collect();
    LastConfiguration {
        components,
        ..LastConfiguration::default()
    }
}

/// Writes the requested sizes into the volume claim templates of the cluster.
pub(super) async fn action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let expansions = &request.spec.volume_expansion;
    update_cluster_spec(ctx, cluster, |cluster| {
        let mut changed = false;
        for expansion in expansions {
            let Some(component) = cluster.component_mut(&expansion.component_name) else {
                continue;
            };
            for requested in &expansion.volume_claim_templates {
                if let Some(vct) = component
                    .volume_claim_templates
                    .iter_mut()
                    .find(|vct| vct.name == requested.name)
                {
                    changed |= vct.storage != requested.storage;
                    vct.storage.clone_from(&requested.storage);
                }
            }
        }
        changed
    })
    .await?;
    Ok(())
}

/// Tracks every PVC of the expanded volume claim templates.
///
/// A PVC completes when it succeeded or failed. Once the timeout passed, PVCs that are still
/// outstanding are marked failed.
pub(super) async fn reconcile_action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<ReconcileOutcome, Error> {
    let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let timeout = i64::try_from(ctx.options.volume_expansion_timeout.as_secs()).unwrap_or(i64::MAX);
    let timed_out = request
        .status
        .as_ref()
        .and_then(|status| status.start_timestamp.as_ref())
        .is_some_and(|start| ctx.now.as_second() > start.0.as_second().saturating_add(timeout));
    let expansions = request.spec.volume_expansion.clone();

    let mut expected = 0;
    let mut succeed = 0;
    let mut completed = 0;
    for expansion in &expansions {
        let Some(component) = cluster.component(&expansion.component_name) else {
            continue;
        };
        for vct in &expansion.volume_claim_templates {
            expected += component.replicas;

            let mut selector = component_selector(cluster, &component.name);
            selector.insert(VOLUME_CLAIM_TEMPLATE_KEY.to_owned(), vct.name.clone());
            let pvcs: Vec<PersistentVolumeClaim> = ctx
                .store
                .list(&namespace, &selector)
                .await
                .context(ListObjectsSnafu {
                    kind: "PersistentVolumeClaim",
                })?;

            let details = &mut request
                .status_mut()
                .components
                .entry(component.name.clone())
                .or_default()
                .progress_details;
            for pvc in &pvcs {
                let name = pvc.name_any();
                if pod_ordinal(&name)
                    .is_none_or(|ordinal| i64::from(ordinal) >= i64::from(component.replicas))
                {
                    continue;
                }
                let key = object_key("PVC", &name);
                if find_progress_detail(details, &key)
                    .is_some_and(|detail| detail.status == ProgressStatus::Failed)
                {
                    completed += 1;
                    continue;
                }

                let detail = if is_expanded(pvc, &vct.storage) {
                    succeed += 1;
                    completed += 1;
                    ProgressDetail::new(&key, ProgressStatus::Succeed)
                        .with_message(succeed_message(VERB, &key, &component.name))
                } else if timed_out {
                    completed += 1;
                    let reason = format!(
                        "timed out waiting for the volume expansion after {}",
                        humantime::format_duration(ctx.options.volume_expansion_timeout)
                    );
                    ProgressDetail::new(&key, ProgressStatus::Failed)
                        .with_message(failed_message(VERB, &key, &component.name, &reason))
                } else if is_resizing(pvc) {
                    ProgressDetail::new(&key, ProgressStatus::Processing)
                        .with_message(processing_message(VERB, &key, &component.name))
                } else {
                    ProgressDetail::new(&key, ProgressStatus::Pending).with_message(format!(
                        "Waiting for an external controller to process the pvc: {key} in \
                         Component: {}",
                        component.name
                    ))
                };
                if let Some(event) =
                    set_progress_detail(details, detail.with_group(&vct.name), ctx.now)
                {
                    ctx.events.push(event);
                }
            }
        }
    }

    let progress = Progress::new(completed, expected);
    if completed == expected {
        let phase = if succeed == expected {
            OpsPhase::Succeed
        } else {
            OpsPhase::Failed
        };
        return Ok(ReconcileOutcome::done(phase, progress));
    }
    if timed_out {
        tracing::warn!(%progress, "volume expansion timed out");
        return Ok(ReconcileOutcome::done(OpsPhase::Failed, progress));
    }
    Ok(ReconcileOutcome::running(
        progress,
        ctx.options.requeue_interval,
    ))
}

fn storage_equals(value: Option<&str>, target: &str) -> bool {
    value.is_some_and(|value| {
        quantity::compare(value, target).is_ok_and(|ordering| ordering == Ordering::Equal)
    })
}

/// Both the requested size and the actual capacity match `target` and the claim is bound.
fn is_expanded(pvc: &PersistentVolumeClaim, target: &str) -> bool {
    let requested = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE))
        .map(|quantity| quantity.0.as_str());
    let Some(status) = &pvc.status else {
        return false;
    };
    let capacity = status
        .capacity
        .as_ref()
        .and_then(|capacity| capacity.get(STORAGE))
        .map(|quantity| quantity.0.as_str());
    storage_equals(requested, target)
        && storage_equals(capacity, target)
        && status.phase.as_deref() == Some("Bound")
}

fn is_resizing(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                matches!(
                    condition.type_.as_str(),
                    "Resizing" | "FileSystemResizePending"
                )
            })
        })
}
