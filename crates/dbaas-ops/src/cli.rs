//! Command line and environment options of the operation engine.

use std::time::Duration;

use clap::Args;

/// Default port the config sidecar listens on inside every database pod.
pub const DEFAULT_SIDECAR_PORT: u16 = 9901;

#[derive(Clone, Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Operation Engine Options")]
pub struct EngineOptions {
    /// Port of the config sidecar running next to every database container.
    #[arg(long, env, default_value_t = DEFAULT_SIDECAR_PORT)]
    pub sidecar_port: u16,

    /// Timeout of a single call to a config sidecar.
    #[arg(long, env, default_value = "10s", value_parser = humantime::parse_duration)]
    pub sidecar_timeout: Duration,

    /// Delay before a running operation is checked again.
    #[arg(long, env, default_value = "1s", value_parser = humantime::parse_duration)]
    pub requeue_interval: Duration,

    /// Volume expansions still in progress after this duration are marked as failed.
    #[arg(long, env, default_value = "30m", value_parser = humantime::parse_duration)]
    pub volume_expansion_timeout: Duration,

    /// How often a write is retried when the object was modified concurrently.
    #[arg(long, env, default_value_t = 5)]
    pub conflict_retries: usize,

    /// Name reported as the source of published events and as field manager of writes.
    #[arg(long, env, default_value = "dbaas-ops")]
    pub controller_name: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sidecar_port: DEFAULT_SIDECAR_PORT,
            sidecar_timeout: Duration::from_secs(10),
            requeue_interval: Duration::from_secs(1),
            volume_expansion_timeout: Duration::from_secs(30 * 60),
            conflict_retries: 5,
            controller_name: "dbaas-ops".to_owned(),
        }
    }
}
