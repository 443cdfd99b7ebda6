use std::cmp::Ordering;

use snafu::ensure;

use super::{
    EmptyPayloadSnafu, Error, OpsContext, RequestExceedsLimitSnafu, ValidationError,
    compare_quantities, ensure_components_exist, update_cluster_spec,
};
use crate::{
    client::ObjectStore,
    crd::{
        Cluster, OpsRequest,
        ops_request::{LastComponentConfiguration, LastConfiguration, VerticalScaling},
    },
};

pub(super) fn validate(request: &OpsRequest, cluster: &Cluster) -> Result<(), Error> {
    let scalings = &request.spec.vertical_scaling;
    ensure!(
        !scalings.is_empty(),
        EmptyPayloadSnafu {
            field: "verticalScaling"
        }
    );
    ensure_components_exist(cluster, request.component_names())?;
    for scaling in scalings {
        ensure_requests_within_limits(scaling)?;
    }
    Ok(())
}

fn ensure_requests_within_limits(scaling: &VerticalScaling) -> Result<(), ValidationError> {
    let (Some(requests), Some(limits)) = (&scaling.resources.requests, &scaling.resources.limits)
    else {
        return Ok(());
    };
    for (resource, request) in requests {
        let Some(limit) = limits.get(resource) else {
            continue;
        };
        ensure!(
            compare_quantities(&request.0, &limit.0)? != Ordering::Greater,
            RequestExceedsLimitSnafu {
                component: &scaling.component_name,
                resource,
                request: &request.0,
                limit: &limit.0,
            }
        );
    }
    Ok(())
}

pub(super) fn save_last_configuration(request: &OpsRequest, cluster: &Cluster) -> LastConfiguration {
    let components = request
        .spec
        .vertical_scaling
        .iter()
        .filter_map(|scaling| cluster.component(&scaling.component_name))
        .map(|component| {
            (component.name.clone(), LastComponentConfiguration {
                resources: component.resources.clone(),
                ..LastComponentConfiguration::default()
            })
        })
        .collect();
    LastConfiguration {
        components,
        ..LastConfiguration::default()
    }
}

/// Writes the requested resources into the component specs.
pub(super) async fn action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let scalings = &request.spec.vertical_scaling;
    update_cluster_spec(ctx, cluster, |cluster| {
        let mut changed = false;
        for scaling in scalings {
            let Some(component) = cluster.component_mut(&scaling.component_name) else {
                continue;
            };
            if component.resources.as_ref() != Some(&scaling.resources) {
                component.resources = Some(scaling.resources.clone());
                changed = true;
            }
        }
        changed
    })
    .await?;
    Ok(())
}
