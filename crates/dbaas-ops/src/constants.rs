use const_format::concatcp;

/// The well-known Kubernetes app key prefix.
const K8S_APP_KEY_PREFIX: &str = "app.kubernetes.io/";

/// The general key prefix for objects managed by the operator.
const APPS_KEY_PREFIX: &str = "apps.dbops.dev/";

/// The key prefix for configuration rollout markers.
const CONFIG_KEY_PREFIX: &str = "config.dbops.dev/";

/// The well-known Kubernetes app instance key `app.kubernetes.io/instance`. Every object backing a
/// cluster carries the cluster name under this key.
pub const K8S_APP_INSTANCE_KEY: &str = concatcp!(K8S_APP_KEY_PREFIX, "instance");

/// The component key `apps.dbops.dev/component-name`, set on pods and PVCs of a component.
pub const COMPONENT_NAME_KEY: &str = concatcp!(APPS_KEY_PREFIX, "component-name");

/// The role key `apps.dbops.dev/role`. It holds the replication role of a pod, e.g. `leader`.
pub const ROLE_KEY: &str = concatcp!(APPS_KEY_PREFIX, "role");

/// The volume claim template key `apps.dbops.dev/volume-claim-template`, set on PVCs.
pub const VOLUME_CLAIM_TEMPLATE_KEY: &str = concatcp!(APPS_KEY_PREFIX, "volume-claim-template");

/// The cluster annotation holding the lock table of running operations.
pub const OPS_REQUEST_ANNOTATION_KEY: &str = concatcp!(APPS_KEY_PREFIX, "ops-request");

/// The pod template annotation that is bumped to trigger a restart.
pub const RESTART_ANNOTATION_KEY: &str = concatcp!(APPS_KEY_PREFIX, "restart");

/// Returns the pod label key marking the rolled out version of a config spec, e.g.
/// `config.dbops.dev/mysql-config-version`.
pub fn config_version_key(config_spec: &str) -> String {
    format!("{CONFIG_KEY_PREFIX}{config_spec}-version")
}

/// Returns the pod template annotation key that carries the restart version of a config spec.
pub fn config_restart_key(config_spec: &str) -> String {
    format!("{CONFIG_KEY_PREFIX}{config_spec}-restart")
}

/// ConfigMap annotation holding the config files as they were before the last reconfiguration.
pub const LAST_APPLIED_CONFIGURATION_KEY: &str =
    concatcp!(CONFIG_KEY_PREFIX, "last-applied-configuration");

/// ConfigMap annotation naming the OpsRequest that last changed the config files.
pub const LAST_APPLIED_OPS_KEY: &str = concatcp!(CONFIG_KEY_PREFIX, "last-applied-ops-name");
