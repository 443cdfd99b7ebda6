//! Mutual exclusion of operations on a cluster.
//!
//! The lock table maps the cluster phase an operation drives the cluster into to the name of the
//! OpsRequest holding it. It is stored as JSON in the [`OPS_REQUEST_ANNOTATION_KEY`] annotation
//! of the cluster, and every change goes through [`update_with_retry`] so that concurrent
//! requests never overwrite each other's entries.

use std::{collections::BTreeMap, convert::Infallible};

use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    client::{Mutation, ObjectStore, UpdateError, UpdateTarget, update_with_retry},
    constants::OPS_REQUEST_ANNOTATION_KEY,
    crd::{Cluster, ClusterPhase},
};

#[derive(Debug, Snafu)]
pub enum TableError {
    #[snafu(display("cluster phase {phase} is held by OpsRequest {holder:?}"))]
    Held { phase: ClusterPhase, holder: String },

    #[snafu(display("failed to parse the lock table annotation"))]
    ParseTable { source: serde_json::Error },

    #[snafu(display("failed to serialize the lock table"))]
    SerializeTable { source: serde_json::Error },
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to update the lock table of cluster {cluster:?}"))]
    UpdateTable {
        source: UpdateError<TableError>,
        cluster: String,
    },

    #[snafu(display("failed to restore the phase of cluster {cluster:?}"))]
    UpdatePhase {
        source: UpdateError<Infallible>,
        cluster: String,
    },
}

impl Error {
    /// The phase and holder of a conflicting lock entry, if that is why the lock failed.
    pub fn conflict(&self) -> Option<(ClusterPhase, &str)> {
        match self {
            Self::UpdateTable {
                source:
                    UpdateError::Mutate {
                        source: TableError::Held { phase, holder },
                        ..
                    },
                ..
            } => Some((*phase, holder.as_str())),
            _ => None,
        }
    }
}

/// Typed view on the lock table of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockTable(BTreeMap<ClusterPhase, String>);

impl LockTable {
    pub fn from_cluster(cluster: &Cluster) -> Result<Self, TableError> {
        match cluster.annotations().get(OPS_REQUEST_ANNOTATION_KEY) {
            None => Ok(Self::default()),
            Some(raw) if raw.trim().is_empty() => Ok(Self::default()),
            Some(raw) => serde_json::from_str(raw).context(ParseTableSnafu),
        }
    }

    fn write_to(&self, cluster: &mut Cluster) -> Result<(), TableError> {
        let annotations = cluster.annotations_mut();
        if self.0.is_empty() {
            annotations.remove(OPS_REQUEST_ANNOTATION_KEY);
        } else {
            let raw = serde_json::to_string(&self.0).context(SerializeTableSnafu)?;
            annotations.insert(OPS_REQUEST_ANNOTATION_KEY.to_owned(), raw);
        }
        Ok(())
    }

    pub fn holder(&self, phase: ClusterPhase) -> Option<&str> {
        self.0.get(&phase).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Phases still locked, in a stable order.
    pub fn phases(&self) -> impl Iterator<Item = ClusterPhase> + '_ {
        self.0.keys().copied()
    }

    /// Inserts `phase -> holder`. Re-acquiring an entry already held by `holder` is a no-op.
    ///
    /// Fails while any entry is held by another request, so a cluster is driven by at most one
    /// operation at a time. Returns whether the table changed.
    pub fn acquire(&mut self, phase: ClusterPhase, holder: &str) -> Result<bool, TableError> {
        if let Some((held, current)) = self.0.iter().find(|(_, current)| *current != holder) {
            return HeldSnafu {
                phase: *held,
                holder: current,
            }
            .fail();
        }
        if self.0.contains_key(&phase) {
            return Ok(false);
        }
        self.0.insert(phase, holder.to_owned());
        Ok(true)
    }

    /// Removes the entry of `phase` if it is still held by `holder`.
    ///
    /// Returns whether the table changed.
    pub fn release(&mut self, phase: ClusterPhase, holder: &str) -> bool {
        if self.holder(phase) == Some(holder) {
            self.0.remove(&phase);
            true
        } else {
            false
        }
    }
}

/// Acquires `phase` on the cluster for the OpsRequest `holder` and returns the updated cluster.
#[tracing::instrument(skip(store))]
pub async fn acquire<S: ObjectStore>(
    store: &S,
    namespace: &str,
    cluster: &str,
    phase: ClusterPhase,
    holder: &str,
    max_attempts: usize,
) -> Result<Cluster, Error> {
    let (cluster_object, acquired) = update_with_retry::<_, Cluster, TableError, _, _>(
        store,
        namespace,
        cluster,
        UpdateTarget::Object,
        max_attempts,
        |cluster| {
            let mut table = LockTable::from_cluster(cluster)?;
            if !table.acquire(phase, holder)? {
                return Ok(Mutation::Unchanged(false));
            }
            table.write_to(cluster)?;
            Ok(Mutation::Changed(true))
        },
    )
    .await
    .context(UpdateTableSnafu { cluster })?;

    if acquired {
        info!("acquired cluster lock");
    } else {
        debug!("cluster lock is already held by this OpsRequest");
    }
    Ok(cluster_object)
}

/// Releases `phase` if it is still held by `holder`.
///
/// When other operations still hold entries, the cluster phase is set to one of their phases.
/// Otherwise, if `restore_running` is set and the cluster is still in `phase`, it is set back to
/// [`ClusterPhase::Running`]. Releasing a lock of a missing cluster, or one held by another
/// request, is a no-op.
#[tracing::instrument(skip(store))]
pub async fn release<S: ObjectStore>(
    store: &S,
    namespace: &str,
    cluster: &str,
    phase: ClusterPhase,
    holder: &str,
    restore_running: bool,
    max_attempts: usize,
) -> Result<(), Error> {
    let result = update_with_retry::<_, Cluster, TableError, _, _>(
        store,
        namespace,
        cluster,
        UpdateTarget::Object,
        max_attempts,
        |cluster| {
            let mut table = LockTable::from_cluster(cluster)?;
            if !table.release(phase, holder) {
                return Ok(Mutation::Unchanged((false, None)));
            }
            table.write_to(cluster)?;
            Ok(Mutation::Changed((true, table.phases().next())))
        },
    )
    .await;

    let (cluster_object, (released, remaining)) = match result {
        Ok(updated) => updated,
        Err(UpdateError::NotFound { .. }) => {
            debug!("cluster is gone, nothing to release");
            return Ok(());
        }
        Err(source) => return Err(source).context(UpdateTableSnafu { cluster }),
    };
    if !released {
        debug!("cluster lock is not held by this OpsRequest");
        return Ok(());
    }
    info!("released cluster lock");

    let next_phase = match remaining {
        Some(remaining) => remaining,
        None if restore_running && cluster_object.phase() == Some(phase) => ClusterPhase::Running,
        None => return Ok(()),
    };
    update_with_retry::<_, Cluster, Infallible, _, _>(
        store,
        namespace,
        cluster,
        UpdateTarget::Status,
        max_attempts,
        |cluster| {
            let status = cluster.status.get_or_insert_with(Default::default);
            if status.phase == Some(next_phase) {
                return Ok(Mutation::Unchanged(()));
            }
            status.phase = Some(next_phase);
            Ok(Mutation::Changed(()))
        },
    )
    .await
    .context(UpdatePhaseSnafu { cluster })?;
    info!(cluster.phase = %next_phase, "updated cluster phase after releasing the lock");
    Ok(())
}
