//! Parameter updates of a component's config files.
//!
//! The action renders the requested parameters into the ConfigMap of the config spec and decides
//! how the change reaches the pods. Progress is driven by the reconfigure policies, one step per
//! reconciliation.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, ensure};

use super::{
    ComponentsNotFoundSnafu, ConfigConstraintMissingSnafu, ConfigConstraintNotFoundSnafu,
    ConfigFileNotFoundSnafu, ConfigMapNotFoundSnafu, ConfigSpecNotFoundSnafu,
    ConfigurationCountSnafu, DiffConfigSnafu, EmptyPayloadSnafu, Error, GetObjectSnafu,
    ImmutableParametersSnafu, InvalidParametersSnafu, ObjectHasNoNamespaceSnafu, OpsContext,
    ReconcileOutcome, SerializeConfigSnafu, UpdateObjectSnafu, ValidationError,
    progress::Progress,
};
use crate::{
    client::{Mutation, ObjectStore, UpdateTarget, update_with_retry},
    constants::{LAST_APPLIED_CONFIGURATION_KEY, LAST_APPLIED_OPS_KEY},
    crd::{
        Cluster, ClusterComponentSpec, ConfigConstraint, OpsPhase, OpsRequest,
        cluster::ComponentConfigSpec,
        config_constraint::{ConfigFiles, ParameterClassification},
        ops_request::{Configuration, ReconfigurePolicyType, ReconfiguringStatus},
    },
    reconfigure::{self, ExecStatus, ReconfigureParams, diff::create_config_diff, format},
};

/// The single configuration a request changes, resolved against the cluster.
struct Target<'a> {
    configuration: &'a Configuration,
    policy: Option<ReconfigurePolicyType>,
    component: &'a ClusterComponentSpec,
    config_spec: &'a ComponentConfigSpec,
}

fn resolve_target<'a>(
    request: &'a OpsRequest,
    cluster: &'a Cluster,
) -> Result<Target<'a>, ValidationError> {
    let reconfigure = request
        .spec
        .reconfigure
        .as_ref()
        .context(EmptyPayloadSnafu {
            field: "reconfigure",
        })?;
    let component = cluster
        .component(&reconfigure.component_name)
        .context(ComponentsNotFoundSnafu {
            names: vec![reconfigure.component_name.clone()],
        })?;

    let [configuration] = reconfigure.configurations.as_slice() else {
        return ConfigurationCountSnafu {
            count: reconfigure.configurations.len(),
        }
        .fail();
    };
    let config_spec =
        component
            .config_spec(&configuration.name)
            .context(ConfigSpecNotFoundSnafu {
                component: &component.name,
                name: &configuration.name,
            })?;

    Ok(Target {
        configuration,
        policy: reconfigure.policy,
        component,
        config_spec,
    })
}

/// Loads the constraint and the ConfigMap backing the target config spec.
async fn load<S: ObjectStore>(
    store: &S,
    cluster: &Cluster,
    target: &Target<'_>,
) -> Result<(ConfigConstraint, ConfigMap), Error> {
    let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let constraint_name = target
        .config_spec
        .constraint_ref
        .as_ref()
        .context(ConfigConstraintMissingSnafu {
            name: &target.config_spec.name,
        })?;
    let constraint = store
        .get_cluster_scoped::<ConfigConstraint>(constraint_name)
        .await
        .context(GetObjectSnafu {
            kind: "ConfigConstraint",
            name: constraint_name,
        })?
        .context(ConfigConstraintNotFoundSnafu {
            name: constraint_name,
        })?;

    let config_map_name = cluster.config_map_name(&target.component.name, &target.config_spec.name);
    let config_map = store
        .get::<ConfigMap>(&namespace, &config_map_name)
        .await
        .context(GetObjectSnafu {
            kind: "ConfigMap",
            name: &config_map_name,
        })?
        .context(ConfigMapNotFoundSnafu {
            name: &config_map_name,
        })?;
    Ok((constraint, config_map))
}

fn ensure_mutable(
    constraint: &ConfigConstraint,
    configuration: &Configuration,
) -> Result<(), ValidationError> {
    let immutable = &constraint.spec.immutable_parameters;
    let parameters: Vec<String> = configuration
        .keys
        .iter()
        .flat_map(|key| &key.parameters)
        .map(|parameter| parameter.key.as_str())
        .filter(|key| {
            let name = key.rsplit_once('.').map_or(*key, |(_, name)| name);
            immutable.iter().any(|param| param == key || param == name)
        })
        .map(str::to_owned)
        .collect();
    ensure!(
        parameters.is_empty(),
        ImmutableParametersSnafu { parameters }
    );
    Ok(())
}

/// Applies the parameter updates to a copy of `files`.
fn render(
    constraint: &ConfigConstraint,
    config_map: &str,
    files: &ConfigFiles,
    configuration: &Configuration,
) -> Result<ConfigFiles, ValidationError> {
    let mut rendered = files.clone();
    for key in &configuration.keys {
        let content = files.get(&key.key).context(ConfigFileNotFoundSnafu {
            file: &key.key,
            config_map,
        })?;
        let updated = format::apply_parameters(constraint.spec.format, content, &key.parameters)
            .context(InvalidParametersSnafu { file: &key.key })?;
        rendered.insert(key.key.clone(), updated);
    }
    Ok(rendered)
}

pub(super) async fn validate<S: ObjectStore>(
    store: &S,
    request: &OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let target = resolve_target(request, cluster)?;
    let (constraint, config_map) = load(store, cluster, &target).await?;
    ensure_mutable(&constraint, target.configuration)?;
    render(
        &constraint,
        &config_map.name_any(),
        &config_map.data.unwrap_or_default(),
        target.configuration,
    )?;
    Ok(())
}

/// Hex encoded sha256 of the config files, used as the version pods are moved to.
fn config_version(files: &ConfigFiles) -> Result<String, Error> {
    let encoded = serde_json::to_vec(files).context(SerializeConfigSnafu)?;
    Ok(format!("{:x}", Sha256::digest(encoded)))
}

fn choose_policy(reloadable: bool, requested: Option<ReconfigurePolicyType>) -> ReconfigurePolicyType {
    match (reloadable, requested.unwrap_or_default()) {
        (true, _) => ReconfigurePolicyType::AutoReload,
        (false, ReconfigurePolicyType::AutoReload) => ReconfigurePolicyType::Simple,
        (false, policy) => policy,
    }
}

/// Renders the new config files into the ConfigMap and plans the rollout.
///
/// The ConfigMap remembers which request changed it last and the files before that change, so
/// repeating the action for the same request yields the same plan without rendering twice.
#[tracing::instrument(skip_all, fields(request = %request.name_any()))]
pub(super) async fn action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<(), Error> {
    let request_name = request.name_any();
    let target = resolve_target(request, cluster)?;
    let (constraint, config_map) = load(ctx.store, cluster, &target).await?;
    let config_map_name = config_map.name_any();
    let current = config_map.data.clone().unwrap_or_default();
    let annotations = config_map.annotations();

    let (old, new) = match (
        annotations.get(LAST_APPLIED_OPS_KEY),
        annotations.get(LAST_APPLIED_CONFIGURATION_KEY),
    ) {
        (Some(applied_by), Some(last_applied)) if *applied_by == request_name => {
            let old: ConfigFiles =
                serde_json::from_str(last_applied).context(SerializeConfigSnafu)?;
            (old, current)
        }
        _ => {
            ensure_mutable(&constraint, target.configuration)?;
            let new = render(&constraint, &config_map_name, &current, target.configuration)?;
            (current, new)
        }
    };

    let diff = create_config_diff(&old, &new, constraint.spec.format).context(DiffConfigSnafu)?;
    let component = target.component.name.clone();
    let config_spec = target.config_spec.name.clone();
    let replicas = target.component.replicas;
    let policy = choose_policy(
        diff.is_reloadable(&ParameterClassification::from(&constraint.spec)),
        target.policy,
    );

    if diff.is_modified() {
        let last_applied = serde_json::to_string(&old).context(SerializeConfigSnafu)?;
        let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
        update_with_retry::<_, ConfigMap, std::convert::Infallible, _, _>(
            ctx.store,
            &namespace,
            &config_map_name,
            UpdateTarget::Object,
            ctx.options.conflict_retries,
            |config_map| {
                let annotations = config_map.annotations();
                if config_map.data.as_ref() == Some(&new)
                    && annotations.get(LAST_APPLIED_OPS_KEY) == Some(&request_name)
                {
                    return Ok(Mutation::Unchanged(()));
                }
                config_map.data = Some(new.clone());
                let annotations = config_map.annotations_mut();
                annotations.insert(LAST_APPLIED_CONFIGURATION_KEY.to_owned(), last_applied.clone());
                annotations.insert(LAST_APPLIED_OPS_KEY.to_owned(), request_name.clone());
                Ok(Mutation::Changed(()))
            },
        )
        .await
        .context(UpdateObjectSnafu {
            kind: "ConfigMap",
            name: &config_map_name,
        })?;
    }

    let status = request.status_mut();
    status
        .last_configuration
        .components
        .entry(component.clone())
        .or_default()
        .config_files = old;
    if !diff.is_modified() {
        tracing::info!(%component, %config_spec, "config files are unchanged");
        status.reconfiguring_status = None;
        return Ok(());
    }

    let target_version = config_version(&new)?;
    tracing::info!(
        %component,
        %config_spec,
        %policy,
        version = %target_version,
        "rendered new config files"
    );
    status.reconfiguring_status = Some(ReconfiguringStatus {
        config_spec,
        policy,
        target_version,
        updated_keys: diff.updated_keys().into_iter().collect(),
        expected_count: replicas,
        ..ReconfiguringStatus::default()
    });
    Ok(())
}

/// Runs one step of the planned rollout.
pub(super) async fn reconcile_action<S: ObjectStore>(
    ctx: &mut OpsContext<'_, S>,
    request: &mut OpsRequest,
    cluster: &Cluster,
) -> Result<ReconcileOutcome, Error> {
    let component_name = request
        .spec
        .reconfigure
        .as_ref()
        .map(|reconfigure| reconfigure.component_name.clone())
        .unwrap_or_default();
    let status = request.status_mut();
    let Some(reconfiguring) = status.reconfiguring_status.as_mut() else {
        return Ok(ReconcileOutcome::done(
            OpsPhase::Succeed,
            Progress::default(),
        ));
    };

    let Some((component, config_spec)) = cluster.component(&component_name).and_then(|component| {
        component
            .config_spec(&reconfiguring.config_spec)
            .map(|config_spec| (component, config_spec))
    }) else {
        reconfiguring.last_exec_status = Some(ExecStatus::Failed.to_string());
        reconfiguring.message = Some(format!(
            "config spec {:?} of component {component_name:?} no longer exists",
            reconfiguring.config_spec
        ));
        return Ok(ReconcileOutcome::done(
            OpsPhase::Failed,
            Progress::new(reconfiguring.succeed_count, reconfiguring.expected_count),
        ));
    };

    let params = ReconfigureParams {
        store: ctx.store,
        sidecar: ctx.sidecar,
        cluster,
        component,
        config_spec,
        target_version: &reconfiguring.target_version,
        sidecar_port: ctx.options.sidecar_port,
        conflict_retries: ctx.options.conflict_retries,
        now: ctx.now,
    };
    let result = reconfigure::upgrade(reconfiguring.policy, &params).await;

    let exec_status = match result {
        Ok(outcome) => {
            reconfiguring.succeed_count = outcome.succeed_count;
            reconfiguring.expected_count = outcome.expected_count;
            reconfiguring.message = None;
            outcome.status
        }
        Err(err) => {
            let exec_status = err.exec_status();
            reconfiguring.message = Some(snafu::Report::from_error(err).to_string());
            exec_status
        }
    };
    reconfiguring.last_exec_status = Some(exec_status.to_string());

    let progress = Progress::new(reconfiguring.succeed_count, reconfiguring.expected_count);
    Ok(match exec_status {
        ExecStatus::None => ReconcileOutcome::done(OpsPhase::Succeed, progress),
        ExecStatus::Failed | ExecStatus::NotSupported => {
            if reconfiguring.message.is_none() {
                reconfiguring.message = Some(format!(
                    "the {} policy can not roll out config spec {:?} to component {:?}",
                    reconfiguring.policy, reconfiguring.config_spec, component.name
                ));
            }
            ReconcileOutcome::done(OpsPhase::Failed, progress)
        }
        ExecStatus::Retry | ExecStatus::RetryFailed => {
            ReconcileOutcome::running(progress, ctx.options.requeue_interval)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use indoc::indoc;
    use k8s_openapi::{
        api::apps::v1::{StatefulSet, StatefulSetSpec},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use rstest::rstest;

    use super::*;
    use crate::{
        constants::config_restart_key,
        crd::{
            ConfigFormat, OpsType,
            config_constraint::ConfigConstraintSpec,
            ops_request::{ParameterConfig, ParameterPair, Reconfigure},
        },
        ops::{
            OpsBehaviour,
            test_support::{Harness, cluster, now, request, spec},
        },
    };

    const MY_CNF: &str = indoc! {"
        [mysqld]
        innodb_buffer_pool_size=1G
        max_connections=100
    "};

    fn constrained_cluster() -> Cluster {
        let mut cluster = cluster();
        if let Some(component) = cluster.component_mut("mysql") {
            component.config_specs[0].constraint_ref = Some("mysql-constraint".to_owned());
        }
        cluster
    }

    fn constraint() -> ConfigConstraint {
        ConfigConstraint::new("mysql-constraint", ConfigConstraintSpec {
            format: ConfigFormat::Ini,
            static_parameters: vec!["innodb_buffer_pool_size".to_owned()],
            dynamic_parameters: vec!["max_connections".to_owned()],
            immutable_parameters: vec!["server_id".to_owned()],
        })
    }

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("mycluster-mysql-mysql-config".to_owned()),
                namespace: Some("default".to_owned()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([("my.cnf".to_owned(), MY_CNF.to_owned())])),
            ..ConfigMap::default()
        }
    }

    fn stateful_set() -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("mycluster-mysql".to_owned()),
                namespace: Some("default".to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(StatefulSetSpec::default()),
            status: None,
        }
    }

    fn reconfigure_request(
        parameters: &[(&str, &str)],
        policy: Option<ReconfigurePolicyType>,
    ) -> OpsRequest {
        let mut spec = spec(OpsType::Reconfigure);
        spec.reconfigure = Some(Reconfigure {
            component_name: "mysql".to_owned(),
            configurations: vec![Configuration {
                name: "mysql-config".to_owned(),
                keys: vec![ParameterConfig {
                    key: "my.cnf".to_owned(),
                    parameters: parameters
                        .iter()
                        .map(|(key, value)| ParameterPair {
                            key: (*key).to_owned(),
                            value: Some((*value).to_owned()),
                        })
                        .collect(),
                }],
            }],
            policy,
        });
        request("reconfigure", spec)
    }

    fn harness() -> Harness {
        let harness = Harness::default();
        harness.store.insert(&constrained_cluster());
        harness.store.insert(&constraint());
        harness.store.insert(&config_map());
        harness
    }

    async fn run_action(harness: &Harness, request: &mut OpsRequest) -> Result<(), Error> {
        let behaviour = OpsBehaviour::for_type(OpsType::Reconfigure);
        action(
            &mut harness.ctx(&behaviour, now()),
            request,
            &constrained_cluster(),
        )
        .await
    }

    async fn run_reconcile(harness: &Harness, request: &mut OpsRequest) -> ReconcileOutcome {
        let behaviour = OpsBehaviour::for_type(OpsType::Reconfigure);
        reconcile_action(
            &mut harness.ctx(&behaviour, now()),
            request,
            &constrained_cluster(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn valid_request_passes() {
        let harness = harness();

        validate(
            &harness.store,
            &reconfigure_request(&[("max_connections", "200")], None),
            &constrained_cluster(),
        )
        .await
        .unwrap();
    }

    #[rstest]
    #[case::immutable(&[("server_id", "2")], "parameters [\"server_id\"] are immutable")]
    #[case::immutable_with_section(
        &[("mysqld.server_id", "2")],
        "parameters [\"mysqld.server_id\"] are immutable"
    )]
    #[tokio::test]
    async fn immutable_parameters_are_rejected(
        #[case] parameters: &[(&str, &str)],
        #[case] message: &str,
    ) {
        let harness = harness();

        let err = validate(
            &harness.store,
            &reconfigure_request(parameters, None),
            &constrained_cluster(),
        )
        .await
        .unwrap_err();

        let Error::Validation { source } = err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert_eq!(source.to_string(), message);
    }

    #[tokio::test]
    async fn unknown_config_spec_is_rejected() {
        let harness = harness();
        let mut request = reconfigure_request(&[("max_connections", "200")], None);
        if let Some(reconfigure) = request.spec.reconfigure.as_mut() {
            reconfigure.configurations[0].name = "proxy-config".to_owned();
        }

        let err = validate(&harness.store, &request, &constrained_cluster())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Validation {
                source: ValidationError::ConfigSpecNotFound { .. }
            }
        ));
    }

    #[tokio::test]
    async fn more_than_one_configuration_is_rejected() {
        let harness = harness();
        let mut request = reconfigure_request(&[("max_connections", "200")], None);
        if let Some(reconfigure) = request.spec.reconfigure.as_mut() {
            let copy = reconfigure.configurations[0].clone();
            reconfigure.configurations.push(copy);
        }

        let err = validate(&harness.store, &request, &constrained_cluster())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Validation {
                source: ValidationError::ConfigurationCount { count: 2 }
            }
        ));
    }

    #[tokio::test]
    async fn missing_constraint_is_rejected() {
        let harness = Harness::default();
        harness.store.insert(&config_map());

        let err = validate(
            &harness.store,
            &reconfigure_request(&[("max_connections", "200")], None),
            &constrained_cluster(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Validation {
                source: ValidationError::ConfigConstraintNotFound { .. }
            }
        ));
    }

    #[tokio::test]
    async fn missing_config_file_is_rejected() {
        let harness = harness();
        let mut request = reconfigure_request(&[("max_connections", "200")], None);
        if let Some(reconfigure) = request.spec.reconfigure.as_mut() {
            reconfigure.configurations[0].keys[0].key = "extra.cnf".to_owned();
        }

        let err = validate(&harness.store, &request, &constrained_cluster())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Validation {
                source: ValidationError::ConfigFileNotFound { .. }
            }
        ));
    }

    #[rstest]
    #[case::dynamic_change_reloads(&[("max_connections", "200")], Some(ReconfigurePolicyType::Rolling), ReconfigurePolicyType::AutoReload)]
    #[case::static_change_restarts(&[("innodb_buffer_pool_size", "2G")], Some(ReconfigurePolicyType::Rolling), ReconfigurePolicyType::Rolling)]
    #[case::simple_by_default(&[("innodb_buffer_pool_size", "2G")], None, ReconfigurePolicyType::Simple)]
    #[case::auto_reload_falls_back(&[("innodb_buffer_pool_size", "2G")], Some(ReconfigurePolicyType::AutoReload), ReconfigurePolicyType::Simple)]
    #[tokio::test]
    async fn action_chooses_policy(
        #[case] parameters: &[(&str, &str)],
        #[case] requested: Option<ReconfigurePolicyType>,
        #[case] expected: ReconfigurePolicyType,
    ) {
        let harness = harness();
        let mut request = reconfigure_request(parameters, requested);

        run_action(&harness, &mut request).await.unwrap();

        let status = request.status.as_ref().unwrap();
        let reconfiguring = status.reconfiguring_status.as_ref().unwrap();
        assert_eq!(reconfiguring.policy, expected);
        assert_eq!(reconfiguring.expected_count, 3);
        assert_eq!(reconfiguring.target_version.len(), 64);
        assert_eq!(
            status.last_configuration.components["mysql"].config_files["my.cnf"],
            MY_CNF
        );
    }

    #[tokio::test]
    async fn action_writes_config_map_and_is_repeatable() {
        let harness = harness();
        let mut request = reconfigure_request(&[("max_connections", "200")], None);

        run_action(&harness, &mut request).await.unwrap();
        let first = request.status.clone();
        let stored: ConfigMap = harness
            .store
            .object(Some("default"), "mycluster-mysql-mysql-config")
            .unwrap();
        let content = &stored.data.as_ref().unwrap()["my.cnf"];
        assert!(content.contains("max_connections=200"), "{content}");
        assert_eq!(
            stored.annotations().get(LAST_APPLIED_OPS_KEY).map(String::as_str),
            Some("reconfigure")
        );

        let mut repeated = reconfigure_request(&[("max_connections", "200")], None);
        run_action(&harness, &mut repeated).await.unwrap();

        assert_eq!(repeated.status, first);
        let writes = harness
            .store
            .writes()
            .into_iter()
            .filter(|(kind, _)| kind == "ConfigMap")
            .count();
        assert_eq!(writes, 1);
        let reconfiguring = first.unwrap().reconfiguring_status.unwrap();
        assert_eq!(reconfiguring.updated_keys, vec!["max_connections".to_owned()]);
    }

    #[tokio::test]
    async fn unchanged_config_succeeds_immediately() {
        let harness = harness();
        let mut request = reconfigure_request(&[("max_connections", "100")], None);

        run_action(&harness, &mut request).await.unwrap();
        let outcome = run_reconcile(&harness, &mut request).await;

        assert_eq!(request.status.as_ref().unwrap().reconfiguring_status, None);
        assert_eq!(outcome.phase, OpsPhase::Succeed);
        assert!(harness.store.writes().is_empty());
    }

    #[tokio::test]
    async fn auto_reload_succeeds_without_touching_pods() {
        let harness = harness();
        let mut request = reconfigure_request(&[("max_connections", "200")], None);

        run_action(&harness, &mut request).await.unwrap();
        let outcome = run_reconcile(&harness, &mut request).await;

        assert_eq!(outcome, ReconcileOutcome::done(OpsPhase::Succeed, Progress::new(3, 3)));
        assert!(harness.sidecar.calls().is_empty());
    }

    #[tokio::test]
    async fn simple_policy_restarts_the_workload() {
        let harness = harness();
        harness.store.insert(&stateful_set());
        let mut request = reconfigure_request(&[("innodb_buffer_pool_size", "2G")], None);

        run_action(&harness, &mut request).await.unwrap();
        let outcome = run_reconcile(&harness, &mut request).await;

        assert_eq!(outcome.phase, OpsPhase::Succeed);
        let version = request
            .status
            .as_ref()
            .unwrap()
            .reconfiguring_status
            .as_ref()
            .unwrap()
            .target_version
            .clone();
        let sts: StatefulSet = harness
            .store
            .object(Some("default"), "mycluster-mysql")
            .unwrap();
        let annotations = sts
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(annotations[&config_restart_key("mysql-config")], version);
    }

    #[tokio::test]
    async fn policy_errors_are_recorded_and_retried() {
        let harness = harness();
        let mut request = reconfigure_request(&[("innodb_buffer_pool_size", "2G")], None);

        run_action(&harness, &mut request).await.unwrap();
        let outcome = run_reconcile(&harness, &mut request).await;

        assert_eq!(outcome.phase, OpsPhase::Running);
        assert!(outcome.requeue_after.is_some());
        let reconfiguring = request
            .status
            .as_ref()
            .unwrap()
            .reconfiguring_status
            .as_ref()
            .unwrap();
        assert_eq!(reconfiguring.last_exec_status.as_deref(), Some("RetryFailed"));
        assert!(
            reconfiguring
                .message
                .as_deref()
                .unwrap()
                .contains("mycluster-mysql"),
            "{reconfiguring:?}"
        );
    }

    #[tokio::test]
    async fn stateless_components_are_not_supported() {
        let harness = Harness::default();
        let mut cluster = constrained_cluster();
        if let Some(component) = cluster.component_mut("mysql") {
            component.workload_type = crate::crd::WorkloadType::Stateless;
        }
        harness.store.insert(&cluster);
        harness.store.insert(&constraint());
        harness.store.insert(&config_map());
        let mut request =
            reconfigure_request(&[("innodb_buffer_pool_size", "2G")], Some(ReconfigurePolicyType::Rolling));
        let behaviour = OpsBehaviour::for_type(OpsType::Reconfigure);

        action(&mut harness.ctx(&behaviour, now()), &mut request, &cluster)
            .await
            .unwrap();
        let outcome = reconcile_action(&mut harness.ctx(&behaviour, now()), &mut request, &cluster)
            .await
            .unwrap();

        assert_eq!(outcome.phase, OpsPhase::Failed);
        let reconfiguring = request.status.unwrap().reconfiguring_status.unwrap();
        assert_eq!(reconfiguring.last_exec_status.as_deref(), Some("NotSupported"));
        assert!(reconfiguring.message.is_some());
    }
}
