use snafu::ensure;

use super::{
    EmptyPayloadSnafu, Error, NegativeReplicasSnafu, OpsContext, ensure_components_exist,
    update_cluster_spec,
};
use crate::{
    client::ObjectStore,
    crd::{
        Cluster, OpsRequest,
        ops_request::{LastComponentConfiguration, LastConfiguration},
    },
};

pub(super) fn validate(request: &OpsRequest, cluster: &Cluster) -> Result<(), Error> {
    let scalings = &request.spec.horizontal_scaling;
    ensure!(
        !scalings.is_empty(),
        EmptyPayloadSnafu {
            field: "horizontalScaling"
        }
    );
    ensure_components_exist(cluster, request.component_names())?;
    for scaling in scalings {
        ensure!(
            scaling.replicas >= 0,
            NegativeReplicasSnafu {
                component: &scaling.component_name,
                replicas: scaling.replicas,
            }
        );
    }
    Ok(())
}

pub(super) fn save_last_configuration(request: &OpsRequest, cluster: &Cluster) -> LastConfiguration {
    let components = request
        .spec
        .horizontal_scaling
        .iter()
        .filter_map(|scaling| cluster.component(&scaling.component_name))
        .map(|component| {
            (component.name.clone(), LastComponentConfiguration {
                replicas: Some(component.replicas),
                ..LastComponentConfiguration::default()
            })
        })
        .collect();
    LastConfiguration {
        components,
        ..LastConfiguration::default()
    }
}

pub(super) async fn action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let scalings = &request.spec.horizontal_scaling;
    update_cluster_spec(ctx, cluster, |cluster| {
        let mut changed = false;
        for scaling in scalings {
            if let Some(component) = cluster.component_mut(&scaling.component_name) {
                changed |= component.replicas != scaling.replicas;
                component.replicas = scaling.replicas;
            }
        }
        changed
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        crd::{OpsType, ops_request::HorizontalScaling},
        ops::{
            OpsBehaviour, ValidationError,
            test_support::{Harness, cluster, now, request, spec},
        },
    };

    fn scaling_request(component: &str, replicas: i32) -> OpsRequest {
        let mut spec = spec(OpsType::HorizontalScaling);
        spec.horizontal_scaling = vec![HorizontalScaling {
            component_name: component.to_owned(),
            replicas,
        }];
        request("hscale", spec)
    }

    #[rstest]
    #[case::scale_in(1)]
    #[case::scale_to_zero(0)]
    #[case::scale_out(5)]
    fn non_negative_replicas_are_valid(#[case] replicas: i32) {
        validate(&scaling_request("mysql", replicas), &cluster()).unwrap();
    }

    #[test]
    fn negative_replicas_are_rejected() {
        let err = validate(&scaling_request("mysql", -1), &cluster()).unwrap_err();

        assert!(matches!(
            err,
            Error::Validation {
                source: ValidationError::NegativeReplicas { replicas: -1, .. }
            }
        ));
    }

    #[test]
    fn unknown_component_is_rejected() {
        let err = validate(&scaling_request("proxy", 1), &cluster()).unwrap_err();

        assert!(matches!(
            err,
            Error::Validation {
                source: ValidationError::ComponentsNotFound { .. }
            }
        ));
    }

    #[tokio::test]
    async fn action_sets_replicas() {
        let harness = Harness::default();
        let cluster = cluster();
        harness.store.insert(&cluster);
        let mut request = scaling_request("mysql", 5);
        let behaviour = OpsBehaviour::for_type(OpsType::HorizontalScaling);

        let snapshot = save_last_configuration(&request, &cluster);
        action(&mut harness.ctx(&behaviour, now()), &mut request, &cluster)
            .await
            .unwrap();

        assert_eq!(snapshot.components["mysql"].replicas, Some(3));
        let stored: Cluster = harness.store.object(Some("default"), "mycluster").unwrap();
        assert_eq!(stored.component("mysql").unwrap().replicas, 5);
    }

    #[tokio::test]
    async fn unchanged_replicas_are_not_written() {
        let harness = Harness::default();
        let cluster = cluster();
        harness.store.insert(&cluster);
        let mut request = scaling_request("mysql", 3);
        let behaviour = OpsBehaviour::for_type(OpsType::HorizontalScaling);

        action(&mut harness.ctx(&behaviour, now()), &mut request, &cluster)
            .await
            .unwrap();

        assert!(harness.store.writes().is_empty());
    }
}
