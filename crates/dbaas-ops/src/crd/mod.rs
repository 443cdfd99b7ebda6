//! Custom resources read and written by the operation engine.

pub mod cluster;
pub mod cluster_version;
pub mod config_constraint;
pub mod ops_request;

pub use cluster::{Cluster, ClusterComponentSpec, ClusterPhase, ComponentPhase, WorkloadType};
pub use cluster_version::ClusterVersion;
pub use config_constraint::{ConfigConstraint, ConfigFormat};
pub use ops_request::{OpsPhase, OpsRequest, OpsType, ProgressDetail, ProgressStatus};
