use snafu::{OptionExt, ResultExt, ensure};

use super::{
    ClusterVersionNotFoundSnafu, EmptyPayloadSnafu, Error, GetObjectSnafu, OpsContext,
    SameClusterVersionSnafu, update_cluster_spec,
};
use crate::{
    client::ObjectStore,
    crd::{Cluster, ClusterVersion, OpsRequest, ops_request::LastConfiguration},
};

pub(super) async fn validate<S: ObjectStore>(
    store: &S,
    request: &OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let upgrade = request
        .spec
        .upgrade
        .as_ref()
        .context(EmptyPayloadSnafu { field: "upgrade" })?;
    let name = &upgrade.cluster_version_ref;
    ensure!(
        *name != cluster.spec.cluster_version_ref,
        SameClusterVersionSnafu { name }
    );
    store
        .get_cluster_scoped::<ClusterVersion>(name)
        .await
        .context(GetObjectSnafu {
            kind: "ClusterVersion",
            name,
        })?
        .context(ClusterVersionNotFoundSnafu { name })?;
    Ok(())
}

pub(super) fn save_last_configuration(cluster: &Cluster) -> LastConfiguration {
    LastConfiguration {
        cluster_version_ref: Some(cluster.spec.cluster_version_ref.clone()),
        ..LastConfiguration::default()
    }
}

/// Points the cluster at the requested ClusterVersion.
pub(super) async fn action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let Some(upgrade) = &request.spec.upgrade else {
        return Ok(());
    };
    let target = &upgrade.cluster_version_ref;
    update_cluster_spec(ctx, cluster, |cluster| {
        if cluster.spec.cluster_version_ref == *target {
            return false;
        }
        cluster.spec.cluster_version_ref.clone_from(target);
        true
    })
    .await?;
    Ok(())
}
