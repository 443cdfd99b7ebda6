//! The object store the engine reads and writes cluster state through.
//!
//! Every mutation carries the resource version it was read at, so a write based on a stale read
//! fails with [`StoreError::Conflict`] instead of overwriting a concurrent change. Callers use
//! [`update_with_retry`] to re-read and re-apply their change in that case.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{ListParams, PostParams},
    core::{ClusterResourceScope, NamespaceResourceScope},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("{kind} {name:?} was modified concurrently, the write was based on a stale version"))]
    Conflict { kind: String, name: String },

    #[snafu(display("failed to get {kind} {name:?}"))]
    GetObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to list {kind} matching {selector:?}"))]
    ListObjects {
        source: kube::Error,
        kind: String,
        selector: String,
    },

    #[snafu(display("failed to replace {kind} {name:?}"))]
    ReplaceObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("{kind} {name:?} has no namespace"))]
    ObjectHasNoNamespace { kind: String, name: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Objects that can be read and written through an [`ObjectStore`].
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Namespaced objects, which are the only ones the engine mutates.
pub trait NamespacedObject: StoreObject + Resource<Scope = NamespaceResourceScope> {}

impl<K> NamespacedObject for K where K: StoreObject + Resource<Scope = NamespaceResourceScope> {}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError>;

    async fn get_cluster_scoped<K>(&self, name: &str) -> Result<Option<K>, StoreError>
    where
        K: StoreObject + Resource<Scope = ClusterResourceScope>;

    /// Lists all objects in `namespace` carrying every label in `selector`.
    async fn list<K: NamespacedObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError>;

    /// Replaces the whole object, failing with [`StoreError::Conflict`] on a stale version.
    async fn replace<K: NamespacedObject>(&self, object: &K) -> Result<K, StoreError>;

    /// Replaces the status subresource, failing with [`StoreError::Conflict`] on a stale version.
    async fn replace_status<K: NamespacedObject>(&self, object: &K) -> Result<K, StoreError>;
}

/// Renders a label selector in the `key=value,...` form understood by the API server.
pub fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_api_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// An [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    post_params: PostParams,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: Some(field_manager.to_owned()),
                ..PostParams::default()
            },
        }
    }

    fn api_for<K: NamespacedObject>(&self, object: &K) -> Result<Api<K>, StoreError> {
        let namespace = object
            .namespace()
            .ok_or_else(|| {
                ObjectHasNoNamespaceSnafu {
                    kind: K::kind(&()).to_string(),
                    name: object.name_any(),
                }
                .build()
            })?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }

    fn map_replace_error<K: NamespacedObject>(err: kube::Error, object: &K) -> StoreError {
        let kind = K::kind(&()).to_string();
        let name = object.name_any();
        if is_api_conflict(&err) {
            StoreError::Conflict { kind, name }
        } else {
            StoreError::ReplaceObject {
                source: err,
                kind,
                name,
            }
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        Api::<K>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .context(GetObjectSnafu {
                kind: K::kind(&()),
                name,
            })
    }

    async fn get_cluster_scoped<K>(&self, name: &str) -> Result<Option<K>, StoreError>
    where
        K: StoreObject + Resource<Scope = ClusterResourceScope>,
    {
        Api::<K>::all(self.client.clone())
            .get_opt(name)
            .await
            .context(GetObjectSnafu {
                kind: K::kind(&()),
                name,
            })
    }

    async fn list<K: NamespacedObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let selector = label_selector(selector);
        let objects = Api::<K>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .context(ListObjectsSnafu {
                kind: K::kind(&()),
                selector: &selector,
            })?;
        Ok(objects.items)
    }

    async fn replace<K: NamespacedObject>(&self, object: &K) -> Result<K, StoreError> {
        let api = self.api_for(object)?;
        api.replace(&object.name_any(), &self.post_params, object)
            .await
            .map_err(|err| Self::map_replace_error(err, object))
    }

    async fn replace_status<K: NamespacedObject>(&self, object: &K) -> Result<K, StoreError> {
        let api = self.api_for(object)?;
        api.replace_status(&object.name_any(), &self.post_params, object)
            .await
            .map_err(|err| Self::map_replace_error(err, object))
    }
}

/// Outcome of a mutation applied by [`update_with_retry`].
pub enum Mutation<T> {
    /// The object was changed and has to be written.
    Changed(T),
    /// Nothing to write.
    Unchanged(T),
}

/// Which part of an object [`update_with_retry`] writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateTarget {
    Object,
    Status,
}

#[derive(Debug, Snafu)]
pub enum UpdateError<E: std::error::Error + 'static> {
    #[snafu(display("{kind} {name:?} not found"))]
    NotFound { kind: String, name: String },

    #[snafu(display("failed to update {kind} {name:?}"))]
    Store {
        source: StoreError,
        kind: String,
        name: String,
    },

    #[snafu(display("{kind} {name:?} was modified concurrently {attempts} times in a row"))]
    TooManyConflicts {
        kind: String,
        name: String,
        attempts: usize,
    },

    #[snafu(display("rejected change to {kind} {name:?}"))]
    Mutate { source: E, kind: String, name: String },
}

/// Re-reads the object, applies `mutate` and writes the result, retrying on conflicts.
///
/// The mutation is re-evaluated against the freshly read object on every attempt, so decisions it
/// takes (like lock ownership checks) always see the latest state.
pub async fn update_with_retry<S, K, E, T, F>(
    store: &S,
    namespace: &str,
    name: &str,
    target: UpdateTarget,
    max_attempts: usize,
    mut mutate: F,
) -> Result<(K, T), UpdateError<E>>
where
    S: ObjectStore + ?Sized,
    K: NamespacedObject,
    E: std::error::Error + 'static,
    F: FnMut(&mut K) -> Result<Mutation<T>, E> + Send,
{
    let kind = K::kind(&()).to_string();
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let mut object: K = store
            .get(namespace, name)
            .await
            .context(StoreSnafu {
                kind: &kind,
                name,
            })?
            .ok_or_else(|| NotFoundSnafu { kind: &kind, name }.build())?;

        let mutation = mutate(&mut object).map_err(|source| UpdateError::Mutate {
            source,
            kind: kind.clone(),
            name: name.to_owned(),
        })?;
        let value = match mutation {
            Mutation::Unchanged(value) => return Ok((object, value)),
            Mutation::Changed(value) => value,
        };

        let written = match target {
            UpdateTarget::Object => store.replace(&object).await,
            UpdateTarget::Status => store.replace_status(&object).await,
        };
        match written {
            Ok(object) => return Ok((object, value)),
            Err(err) if err.is_conflict() => {
                debug!(%kind, name, attempt, "write conflicted, re-reading object");
            }
            Err(err) => {
                return Err(err).context(StoreSnafu {
                    kind: &kind,
                    name,
                });
            }
        }
    }

    TooManyConflictsSnafu {
        kind,
        name,
        attempts: max_attempts,
    }
    .fail()
}
