use super::*;
use gateway_controller_k8s_api::{
    gateway::{
        BackendReference, Gateway, GatewayClass, GatewayClassSpec, GatewaySpec, Listener,
        ParentReference, RouteRule, TCPRoute, TCPRouteSpec, UDPRoute, UDPRouteSpec,
    },
    labels, ConfigMap, ErrorResponse, ObjectMeta, Resource, ResourceExt, Selector, Service,
    ServiceSpec,
};
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, num::NonZeroU16, sync::Arc, time::Duration};


pub(crate) const CONTROLLER_NAME: &str = "kube-vip.io/gateway-controller";
const IMPLEMENTATION: &str = "kube-vip";
const CLASS_NAME: &str = "kube-vip";

/// (kind, namespace, name). Cluster-scoped objects have an empty namespace.
type Key = (String, String, String);

/// An in-memory [`Store`] with resource versions.
///
/// Every call yields before touching state so that concurrent invocations on
/// a single-threaded runtime interleave between their reads and writes.
#[derive(Clone, Default)]
struct MemStore {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, serde_json::Value>,
    version: u64,
    writes: usize,
    /// Kinds whose next call fails.
    faults: Vec<String>,
}

fn key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn labels_of(value: &serde_json::Value) -> labels::Map {
    serde_json::from_value(value["metadata"]["labels"].clone()).unwrap_or_default()
}

fn not_found(what: String) -> StoreError {
    StoreError::Api(gateway_controller_k8s_api::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{what} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

impl MemStore {
    /// Stores an object without counting it as a write.
    fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, object: K) {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let mut value = serde_json::to_value(&object).expect("object must serialize");
        let mut state = self.state.lock();
        state.version += 1;
        value["metadata"]["resourceVersion"] = state.version.to_string().into();
        state.objects.insert(key::<K>(&namespace, &name), value);
    }

    fn fetch<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.state
            .lock()
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).expect("object must deserialize"))
    }

    fn remove<K: Resource<DynamicType = ()>>(&self, namespace: &str, name: &str) {
        self.state.lock().objects.remove(&key::<K>(namespace, name));
    }

    fn all<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = K::kind(&());
        self.state
            .lock()
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("object must deserialize"))
            .collect()
    }

    fn writes(&self) -> usize {
        self.state.lock().writes
    }

    fn fail_next<K: Resource<DynamicType = ()>>(&self) {
        self.state.lock().faults.push(K::kind(&()).to_string());
    }

    fn check_fault<K: Resource<DynamicType = ()>>(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let kind = K::kind(&());
        if let Some(i) = state.faults.iter().position(|k| *k == kind) {
            state.faults.remove(i);
            return Err(StoreError::Timeout(Duration::from_secs(5)));
        }
        Ok(())
    }

    fn check_version(
        current: &serde_json::Value,
        resource_version: Option<&str>,
        what: impl FnOnce() -> String,
    ) -> Result<(), StoreError> {
        match resource_version {
            Some(rv) if current["metadata"]["resourceVersion"].as_str() != Some(rv) => {
                Err(StoreError::Conflict(what()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn get<K: Namespaced>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        tokio::task::yield_now().await;
        self.check_fault::<K>()?;
        Ok(self.fetch(namespace, name))
    }

    async fn get_cluster<K: ClusterScoped>(&self, name: &str) -> Result<Option<K>, StoreError> {
        tokio::task::yield_now().await;
        self.check_fault::<K>()?;
        Ok(self.fetch("", name))
    }

    async fn list<K: Namespaced>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>, StoreError> {
        tokio::task::yield_now().await;
        self.check_fault::<K>()?;
        let kind = K::kind(&());
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.map_or(true, |n| n == ns))
            .filter(|(_, v)| selector.matches(&labels_of(v)))
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("object must deserialize"))
            .collect())
    }

    async fn create<K: Namespaced>(&self, object: &K) -> Result<K, StoreError> {
        tokio::task::yield_now().await;
        self.check_fault::<K>()?;
        let namespace = object
            .namespace()
            .ok_or_else(|| StoreError::MissingNamespace(object.name_any()))?;
        let key = key::<K>(&namespace, &object.name_any());
        let mut value = serde_json::to_value(object).expect("object must serialize");

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{key:?}")));
        }
        state.version += 1;
        state.writes += 1;
        value["metadata"]["resourceVersion"] = state.version.to_string().into();
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value).expect("object must deserialize"))
    }

    async fn replace<K: Namespaced>(&self, object: &K) -> Result<K, StoreError> {
        tokio::task::yield_now().await;
        self.check_fault::<K>()?;
        let namespace = object
            .namespace()
            .ok_or_else(|| StoreError::MissingNamespace(object.name_any()))?;
        let key = key::<K>(&namespace, &object.name_any());
        let mut value = serde_json::to_value(object).expect("object must serialize");

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(current) = state.objects.get_mut(&key) else {
            return Err(not_found(format!("{key:?}")));
        };
        Self::check_version(current, object.resource_version().as_deref(), || {
            format!("{key:?}")
        })?;
        state.version += 1;
        state.writes += 1;
        value["metadata"]["resourceVersion"] = state.version.to_string().into();
        *current = value.clone();
        Ok(serde_json::from_value(value).expect("object must deserialize"))
    }

    async fn patch_labels<K: Namespaced>(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<K, StoreError> {
        tokio::task::yield_now().await;
        self.check_fault::<K>()?;
        let key = key::<K>(namespace, name);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(current) = state.objects.get_mut(&key) else {
            return Err(not_found(format!("{key:?}")));
        };
        Self::check_version(current, resource_version.as_deref(), || format!("{key:?}"))?;
        let current_labels = &mut current["metadata"]["labels"];
        for (k, v) in labels {
            match v {
                Some(v) => current_labels[k.as_str()] = serde_json::Value::String(v),
                None => {
                    if let Some(map) = current_labels.as_object_mut() {
                        map.remove(&k);
                    }
                }
            }
        }
        state.version += 1;
        state.writes += 1;
        current["metadata"]["resourceVersion"] = state.version.to_string().into();
        Ok(serde_json::from_value(current.clone()).expect("object must deserialize"))
    }

    async fn delete<K: Namespaced>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.check_fault::<K>()?;
        let mut state = self.state.lock();
        if state.objects.remove(&key::<K>(namespace, name)).is_some() {
            state.writes += 1;
        }
        Ok(())
    }
}

// === fixtures ===

fn mk_config() -> Config {
    Config {
        controller_name: CONTROLLER_NAME.to_string(),
        implementation: IMPLEMENTATION.to_string(),
        pool_config: ResourceId::new("kube-system", "kubevip"),
        ledger: ResourceId::new("kube-system", "gateway-api-ipam-ledger"),
    }
}

fn mk_driver(store: &MemStore) -> Driver<MemStore> {
    Driver::new(
        store.clone(),
        mk_config(),
        DriverMetrics::register(&mut Registry::default()),
    )
}

/// A store holding this controller's GatewayClass and a pool configuration.
fn mk_cluster(pools: &[(&str, &str)]) -> MemStore {
    let store = MemStore::default();
    store.insert(mk_gateway_class(CLASS_NAME, CONTROLLER_NAME));
    store.insert(mk_pool_config(pools));
    store
}

fn mk_pool_config(pools: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some("kube-system".to_string()),
            name: Some("kubevip".to_string()),
            ..Default::default()
        },
        data: Some(
            pools
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

fn mk_gateway_class(name: &str, controller_name: &str) -> GatewayClass {
    GatewayClass::new(
        name,
        GatewayClassSpec {
            controller_name: controller_name.to_string(),
            description: None,
        },
    )
}

fn mk_gateway(ns: &str, name: &str, listeners: &[(&str, u16, &str)]) -> Gateway {
    let mut gateway = Gateway::new(
        name,
        GatewaySpec {
            gateway_class_name: CLASS_NAME.to_string(),
            listeners: listeners
                .iter()
                .map(|(name, port, protocol)| Listener {
                    name: name.to_string(),
                    port: NonZeroU16::new(*port).expect("port must be non-zero"),
                    protocol: protocol.to_string(),
                    hostname: None,
                })
                .collect(),
        },
    );
    gateway.metadata.namespace = Some(ns.to_string());
    gateway
}

pub(crate) fn parent_ref(ns: Option<&str>, name: &str, section_name: Option<&str>) -> ParentReference {
    ParentReference {
        group: None,
        kind: None,
        namespace: ns.map(Into::into),
        name: name.to_string(),
        section_name: section_name.map(Into::into),
        port: None,
    }
}

pub(crate) fn backend_ref(ns: Option<&str>, name: &str, port: Option<u16>) -> BackendReference {
    BackendReference {
        group: None,
        kind: None,
        namespace: ns.map(Into::into),
        name: name.to_string(),
        port: port.and_then(NonZeroU16::new),
        weight: None,
    }
}

pub(crate) fn mk_rules(backends: Vec<BackendReference>) -> Vec<RouteRule> {
    vec![RouteRule {
        name: None,
        backend_refs: backends,
    }]
}

pub(crate) fn mk_tcp_route(
    ns: &str,
    name: &str,
    parents: Vec<ParentReference>,
    backends: Vec<BackendReference>,
) -> TCPRoute {
    let mut route = TCPRoute::new(
        name,
        TCPRouteSpec {
            parent_refs: Some(parents),
            rules: mk_rules(backends),
        },
    );
    route.metadata.namespace = Some(ns.to_string());
    route
}

fn mk_udp_route(
    ns: &str,
    name: &str,
    parents: Vec<ParentReference>,
    backends: Vec<BackendReference>,
) -> UDPRoute {
    let mut route = UDPRoute::new(
        name,
        UDPRouteSpec {
            parent_refs: Some(parents),
            rules: mk_rules(backends),
        },
    );
    route.metadata.namespace = Some(ns.to_string());
    route
}

pub(crate) fn mk_service(ns: &str, name: &str, app: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ledger_entries(store: &MemStore) -> BTreeMap<String, String> {
    store
        .fetch::<ConfigMap>("kube-system", "gateway-api-ipam-ledger")
        .and_then(|cm| cm.data)
        .unwrap_or_default()
}
