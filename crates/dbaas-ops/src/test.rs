use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{
        ContainerStatus, ObjectReference, PersistentVolumeClaim, Pod, PodCondition, PodStatus,
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    jiff::Timestamp,
};
use kube::{Resource, ResourceExt, core::ClusterResourceScope};
use serde::Serialize;
use serde_json::Value;

use crate::{
    client::{NamespacedObject, ObjectStore, StoreError, StoreObject},
    constants::{COMPONENT_NAME_KEY, K8S_APP_INSTANCE_KEY, ROLE_KEY},
    logging::k8s_events::{EventRecorder, OpsEvent},
    reconfigure::sidecar::{SidecarClient, SidecarError},
};

type ObjectKey = (String, String, String);

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<ObjectKey, Value>,
    conflicts: BTreeMap<(String, String), usize>,
    failures: BTreeMap<(String, String), usize>,
    failing_lists: BTreeSet<String>,
    next_resource_version: u64,
    writes: Vec<(String, String)>,
}

/// An [`ObjectStore`] keeping objects as JSON in memory, with resource version checks and
/// injectable write failures.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

fn key_of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        K::kind(&()).to_string(),
        namespace.unwrap_or_default().to_owned(),
        name.to_owned(),
    )
}

fn injected_error() -> kube::Error {
    kube::Error::SerdeError(serde_json::from_str::<Value>("{").unwrap_err())
}

impl InMemoryStore {
    pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, object: &K) {
        let mut state = self.state.lock().unwrap();
        state.next_resource_version += 1;
        let mut value = serde_json::to_value(object).unwrap();
        value["metadata"]["resourceVersion"] = Value::from(state.next_resource_version.to_string());
        if value["metadata"]["generation"].is_null() {
            value["metadata"]["generation"] = Value::from(1);
        }
        let key = key_of::<K>(object.meta().namespace.as_deref(), &object.name_any());
        state.objects.insert(key, value);
    }

    pub fn object<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    pub fn remove<K: StoreObject>(&self, namespace: Option<&str>, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&key_of::<K>(namespace, name));
    }

    /// Makes the next `times` writes to the object fail with a conflict.
    pub fn conflict_next_writes(&self, kind: &str, name: &str, times: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .conflicts
            .insert((kind.to_owned(), name.to_owned()), times);
    }

    /// Makes the next `times` writes to the object fail with a non-conflict error.
    pub fn fail_next_writes(&self, kind: &str, name: &str, times: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .insert((kind.to_owned(), name.to_owned()), times);
    }

    pub fn fail_lists_of(&self, kind: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_lists.insert(kind.to_owned());
    }

    /// Successful writes as `(kind, name)`, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().writes.clone()
    }

    fn write<K: NamespacedObject>(&self, object: &K, status_only: bool) -> Result<K, StoreError> {
        let kind = K::kind(&()).to_string();
        let name = object.name_any();
        let mut state = self.state.lock().unwrap();

        if let Some(remaining) = state.failures.get_mut(&(kind.clone(), name.clone())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::ReplaceObject {
                    source: injected_error(),
                    kind,
                    name,
                });
            }
        }
        if let Some(remaining) = state.conflicts.get_mut(&(kind.clone(), name.clone())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Conflict { kind, name });
            }
        }

        let key = key_of::<K>(object.meta().namespace.as_deref(), &name);
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(StoreError::ReplaceObject {
                source: injected_error(),
                kind,
                name,
            });
        };

        let incoming = serde_json::to_value(object).unwrap();
        let stored_version = &stored["metadata"]["resourceVersion"];
        let incoming_version = &incoming["metadata"]["resourceVersion"];
        if !incoming_version.is_null() && incoming_version != stored_version {
            return Err(StoreError::Conflict { kind, name });
        }

        let mut next = if status_only {
            let mut next = stored.clone();
            next["status"] = incoming["status"].clone();
            next
        } else {
            let mut next = incoming;
            next["status"] = stored["status"].clone();
            if !next["spec"].is_null() && next["spec"] != stored["spec"] {
                let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
                next["metadata"]["generation"] = Value::from(generation + 1);
            } else {
                next["metadata"]["generation"] = stored["metadata"]["generation"].clone();
            }
            next
        };
        if next["status"].is_null() {
            if let Some(map) = next.as_object_mut() {
                map.remove("status");
            }
        }

        state.next_resource_version += 1;
        next["metadata"]["resourceVersion"] = Value::from(state.next_resource_version.to_string());
        state.objects.insert(key, next.clone());
        state.writes.push((kind, name));
        Ok(serde_json::from_value(next).unwrap())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        Ok(self.object(Some(namespace), name))
    }

    async fn get_cluster_scoped<K>(&self, name: &str) -> Result<Option<K>, StoreError>
    where
        K: StoreObject + Resource<Scope = ClusterResourceScope>,
    {
        Ok(self.object(None, name))
    }

    async fn list<K: NamespacedObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock().unwrap();
        if state.failing_lists.contains(&kind) {
            return Err(StoreError::ListObjects {
                source: injected_error(),
                kind,
                selector: crate::client::label_selector(selector),
            });
        }

        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, value)| serde_json::from_value::<K>(value.clone()).unwrap())
            .filter(|object| {
                let labels = object.labels();
                selector
                    .iter()
                    .all(|(key, value)| labels.get(key) == Some(value))
            })
            .collect())
    }

    async fn replace<K: NamespacedObject>(&self, object: &K) -> Result<K, StoreError> {
        self.write(object, false)
    }

    async fn replace_status<K: NamespacedObject>(&self, object: &K) -> Result<K, StoreError> {
        self.write(object, true)
    }
}

/// Records published events instead of sending them.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(ObjectReference, OpsEvent)>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<OpsEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn publish(&self, target: &ObjectReference, event: OpsEvent) {
        self.events.lock().unwrap().push((target.clone(), event));
    }
}

/// A sidecar that records stop calls and can be told to reject some addresses.
#[derive(Default)]
pub struct FakeSidecar {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeSidecar {
    pub fn fail_for(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_owned());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SidecarClient for FakeSidecar {
    async fn stop_container(
        &self,
        address: &str,
        container_ids: &[String],
    ) -> Result<(), SidecarError> {
        self.calls
            .lock()
            .unwrap()
            .push((address.to_owned(), container_ids.to_vec()));
        if self.failing.lock().unwrap().contains(address) {
            return Err(SidecarError::Rejected {
                address: address.to_owned(),
                message: "container not found".to_owned(),
            });
        }
        Ok(())
    }
}

pub fn ts(secs: i64) -> Timestamp {
    Timestamp::from_second(secs).unwrap()
}

pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    /// A running pod of `{cluster}-{component}-{ordinal}` with an IP and a ready condition.
    pub fn new(cluster: &str, component: &str, ordinal: usize) -> Self {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(format!("{cluster}-{component}-{ordinal}")),
                namespace: Some("default".to_owned()),
                labels: Some(BTreeMap::from([
                    (K8S_APP_INSTANCE_KEY.to_owned(), cluster.to_owned()),
                    (COMPONENT_NAME_KEY.to_owned(), component.to_owned()),
                ])),
                creation_timestamp: Some(Time(ts(1_000))),
                ..ObjectMeta::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".to_owned()),
                pod_ip: Some(format!("10.0.0.{}", ordinal + 1)),
                ..PodStatus::default()
            }),
        };
        Self { pod }.ready_since(ts(1_000))
    }

    pub fn role(mut self, role: &str) -> Self {
        self.pod
            .labels_mut()
            .insert(ROLE_KEY.to_owned(), role.to_owned());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .labels_mut()
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn created_at(mut self, time: Timestamp) -> Self {
        self.pod.metadata.creation_timestamp = Some(Time(time));
        self
    }

    pub fn ready_since(mut self, time: Timestamp) -> Self {
        let status = self.pod.status.get_or_insert_with(PodStatus::default);
        status.conditions = Some(vec![PodCondition {
            type_: "Ready".to_owned(),
            status: "True".to_owned(),
            last_transition_time: Some(Time(time)),
            ..PodCondition::default()
        }]);
        self
    }

    pub fn not_ready(mut self) -> Self {
        let status = self.pod.status.get_or_insert_with(PodStatus::default);
        status.conditions = Some(vec![PodCondition {
            type_: "Ready".to_owned(),
            status: "False".to_owned(),
            ..PodCondition::default()
        }]);
        self
    }

    pub fn without_ip(mut self) -> Self {
        if let Some(status) = self.pod.status.as_mut() {
            status.pod_ip = None;
        }
        self
    }

    pub fn container(mut self, name: &str, id: &str) -> Self {
        let status = self.pod.status.get_or_insert_with(PodStatus::default);
        status
            .container_statuses
            .get_or_insert_with(Vec::new)
            .push(ContainerStatus {
                name: name.to_owned(),
                container_id: Some(id.to_owned()),
                ready: true,
                ..ContainerStatus::default()
            });
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

/// A bound PVC `{vct}-{cluster}-{component}-{ordinal}` with the given request and capacity.
pub fn pvc(
    cluster: &str,
    component: &str,
    vct: &str,
    ordinal: usize,
    request: &str,
    capacity: &str,
) -> PersistentVolumeClaim {
    use k8s_openapi::{
        api::core::v1::{PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, VolumeResourceRequirements},
        apimachinery::pkg::api::resource::Quantity,
    };

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(format!("{vct}-{cluster}-{component}-{ordinal}")),
            namespace: Some("default".to_owned()),
            labels: Some(BTreeMap::from([
                (K8S_APP_INSTANCE_KEY.to_owned(), cluster.to_owned()),
                (COMPONENT_NAME_KEY.to_owned(), component.to_owned()),
                (
                    crate::constants::VOLUME_CLAIM_TEMPLATE_KEY.to_owned(),
                    vct.to_owned(),
                ),
            ])),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_owned(),
                    Quantity(request.to_owned()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_owned()),
            capacity: Some(BTreeMap::from([(
                "storage".to_owned(),
                Quantity(capacity.to_owned()),
            )])),
            ..PersistentVolumeClaimStatus::default()
        }),
    }
}
