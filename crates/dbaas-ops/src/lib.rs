//! Operation orchestration for database clusters.
//!
//! An [`OpsRequest`](crd::OpsRequest) asks for a single day-2 operation on a
//! [`Cluster`](crd::Cluster): an upgrade, vertical or horizontal scaling, a volume expansion, a
//! restart or a reconfiguration. The [`ops::OpsManager`] validates it, locks the cluster phase it
//! needs, applies the change and tracks its progress until it succeeds or fails. Configuration
//! changes are rolled out to the pods by the policies in [`reconfigure`].

pub mod cli;
pub mod client;
pub mod constants;
pub mod crd;
pub mod logging;
pub mod ops;
pub mod pod_utils;
pub mod quantity;
pub mod reconfigure;
pub mod status;

#[cfg(test)]
mod test;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
