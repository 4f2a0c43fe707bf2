use gateway_controller_k8s_api::{
    self as k8s, Api, ClusterResourceScope, DeleteParams, ErrorResponse, ListParams,
    NamespaceResourceScope, Patch, PatchParams, PostParams, Resource, ResourceExt, Selector,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, fmt, future::Future};
use tokio::time;

/// A namespaced object kind the store can hold.
pub trait Namespaced:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> Namespaced for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// A cluster-scoped object kind the store can hold.
pub trait ClusterScoped:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterScoped for K where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + Clone
        + fmt::Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Object storage, as seen by the reconcilers.
///
/// Absent objects are reported as `Ok(None)` by `get` and deleting an absent
/// object succeeds, so every operation is safe to repeat.
#[async_trait::async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    async fn get<K: Namespaced>(&self, namespace: &str, name: &str)
        -> Result<Option<K>, StoreError>;

    async fn get_cluster<K: ClusterScoped>(&self, name: &str) -> Result<Option<K>, StoreError>;

    /// Lists objects in `namespace`, or in all namespaces when `None`.
    async fn list<K: Namespaced>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError>;

    /// Fails with `AlreadyExists` if an object with the same name exists.
    async fn create<K: Namespaced>(&self, object: &K) -> Result<K, StoreError>;

    /// Fails with `Conflict` if the object's resource version is stale.
    async fn replace<K: Namespaced>(&self, object: &K) -> Result<K, StoreError>;

    /// Sets (`Some`) or removes (`None`) labels without touching any other
    /// field. When `resource_version` is set, fails with `Conflict` if it is
    /// stale.
    async fn patch_labels<K: Namespaced>(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<K, StoreError>;

    async fn delete<K: Namespaced>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} has no namespace")]
    MissingNamespace(String),

    #[error("request timed out after {0:?}")]
    Timeout(time::Duration),

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

/// A [`Store`] backed by the Kubernetes API.
///
/// Every request is bounded by `timeout`.
#[derive(Clone)]
pub struct KubeStore {
    client: k8s::Client,
    timeout: time::Duration,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: k8s::Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }

    fn api<K: Namespaced>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn call<T>(
        &self,
        what: impl FnOnce() -> String,
        f: impl Future<Output = Result<T, k8s::Error>>,
    ) -> Result<T, StoreError> {
        match time::timeout(self.timeout, f).await {
            Err(_) => Err(StoreError::Timeout(self.timeout)),
            Ok(Ok(t)) => Ok(t),
            Ok(Err(k8s::Error::Api(ErrorResponse { code: 409, reason, .. })))
                if reason == "AlreadyExists" =>
            {
                Err(StoreError::AlreadyExists(what()))
            }
            Ok(Err(k8s::Error::Api(ErrorResponse { code: 409, .. }))) => {
                Err(StoreError::Conflict(what()))
            }
            Ok(Err(error)) => Err(error.into()),
        }
    }
}

fn describe<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> String {
    format!("{} {namespace}/{name}", K::kind(&()))
}

fn namespace_of<K: Namespaced>(object: &K) -> Result<String, StoreError> {
    object
        .namespace()
        .ok_or_else(|| StoreError::MissingNamespace(format!("{} {}", K::kind(&()), object.name_any())))
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get<K: Namespaced>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        let api = self.api::<K>(namespace);
        self.call(|| describe::<K>(namespace, name), api.get_opt(name))
            .await
    }

    async fn get_cluster<K: ClusterScoped>(&self, name: &str) -> Result<Option<K>, StoreError> {
        let api = Api::<K>::all(self.client.clone());
        self.call(|| format!("{} {name}", K::kind(&())), api.get_opt(name))
            .await
    }

    async fn list<K: Namespaced>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError> {
        let api = match namespace {
            Some(ns) => self.api::<K>(ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = self
            .call(
                || format!("{} list", K::kind(&())),
                api.list(&params),
            )
            .await?;
        Ok(list.items)
    }

    async fn create<K: Namespaced>(&self, object: &K) -> Result<K, StoreError> {
        let namespace = namespace_of(object)?;
        let name = object.name_any();
        let api = self.api::<K>(&namespace);
        self.call(
            || describe::<K>(&namespace, &name),
            api.create(&PostParams::default(), object),
        )
        .await
    }

    async fn replace<K: Namespaced>(&self, object: &K) -> Result<K, StoreError> {
        let namespace = namespace_of(object)?;
        let name = object.name_any();
        let api = self.api::<K>(&namespace);
        self.call(
            || describe::<K>(&namespace, &name),
            api.replace(&name, &PostParams::default(), object),
        )
        .await
    }

    async fn patch_labels<K: Namespaced>(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<K, StoreError> {
        let mut metadata = serde_json::json!({ "labels": labels });
        if let Some(rv) = resource_version {
            // A resource version in a merge patch is a precondition on the
            // write.
            metadata["resourceVersion"] = serde_json::Value::String(rv);
        }
        let patch = serde_json::json!({ "metadata": metadata });
        let api = self.api::<K>(namespace);
        self.call(
            || describe::<K>(namespace, name),
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }

    async fn delete<K: Namespaced>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api = self.api::<K>(namespace);
        match self
            .call(
                || describe::<K>(namespace, name),
                api.delete(name, &DeleteParams::default()),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Api(k8s::Error::Api(ErrorResponse { code: 404, .. }))) => Ok(()),
            Err(error) => Err(error),
        }
    }
}
