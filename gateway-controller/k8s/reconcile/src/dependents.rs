//! Relations between routes and the objects they depend on, used to decide
//! which routes to reconcile again when a Gateway or Service changes.

use crate::ResourceId;
use gateway_controller_k8s_api::{gateway::Route, labels, ResourceExt, Service};

/// Endpoints are named after their backend with this suffix.
const ENDPOINT_SUFFIX: &str = "-gw-api";

/// The Endpoint that exposes a backend.
pub fn endpoint_id(backend: &ResourceId) -> ResourceId {
    ResourceId::new(
        &backend.namespace,
        format!("{}{ENDPOINT_SUFFIX}", backend.name),
    )
}

/// Whether any of the route's parent references name the Gateway.
pub fn references_gateway<R: Route>(route: &R, gateway: &ResourceId) -> bool {
    let Some(route_ns) = route.namespace() else {
        return false;
    };
    route.parent_refs().iter().any(|parent| {
        parent.targets_gateway()
            && parent.name == gateway.name
            && parent.namespace_or(&route_ns) == gateway.namespace
    })
}

/// Whether any of the route's backend references name the Service.
pub fn references_backend<R: Route>(route: &R, backend: &ResourceId) -> bool {
    let Some(route_ns) = route.namespace() else {
        return false;
    };
    route.backend_refs().any(|backend_ref| {
        backend_ref.targets_service()
            && backend_ref.name == backend.name
            && backend_ref.namespace_or(&route_ns) == backend.namespace
    })
}

/// The Endpoints the route's backends are exposed through.
pub fn route_endpoints<R: Route>(route: &R) -> Vec<ResourceId> {
    let Some(route_ns) = route.namespace() else {
        return Vec::new();
    };
    let mut endpoints = route
        .backend_refs()
        .filter(|backend_ref| backend_ref.targets_service())
        .map(|backend_ref| {
            endpoint_id(&ResourceId::new(
                backend_ref.namespace_or(&route_ns),
                &backend_ref.name,
            ))
        })
        .collect::<Vec<_>>();
    endpoints.sort();
    endpoints.dedup();
    endpoints
}

/// The route of kind `R` that owns an Endpoint, if the Endpoint was written by
/// this controller for such a route.
///
/// Endpoints written before the route namespace was recorded are owned by a
/// route in their own namespace.
pub fn endpoint_owner<R: Route>(endpoint: &Service, controller_name: &str) -> Option<ResourceId> {
    let annotations = endpoint.annotations();
    if annotations.get(labels::CONTROLLER_ANNOTATION).map(String::as_str) != Some(controller_name)
    {
        return None;
    }
    let route_name = annotations.get(R::OWNER_ANNOTATION)?;
    let route_ns = match annotations.get(labels::ROUTE_NAMESPACE_ANNOTATION) {
        Some(ns) => ns.clone(),
        None => endpoint.namespace()?,
    };
    Some(ResourceId::new(route_ns, route_name))
}
