use crate::{
    k8s::{
        gateway::{Gateway, GatewayClass, Route, TCPRoute, UDPRoute},
        labels, Api, Client, ConfigMap, ResourceExt, Service,
    },
    reconcile::{dependents, ledger_owners, Driver, Error, KubeStore, Namespaced, ResourceId},
};
use futures::prelude::*;
use kube::runtime::{
    controller::{self, Action},
    reflector::{ObjectRef, Store as Cache},
    watcher, Controller,
};
use std::sync::Arc;
use tokio::time;
use tracing::{info_span, Instrument};

/// State shared by every controller.
pub(crate) struct Context {
    driver: Driver<KubeStore>,
    controller_name: String,
    requeue_delay: time::Duration,
}

impl Context {
    pub(crate) fn new(
        driver: Driver<KubeStore>,
        controller_name: String,
        requeue_delay: time::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            controller_name,
            requeue_delay,
        })
    }
}

/// Addresses Gateways. A GatewayClass change reconciles the Gateways of that
/// class.
pub(crate) fn gateways(client: &Client, ctx: Arc<Context>, shutdown: drain::Watch) -> Cache<Gateway> {
    let controller = Controller::new(Api::<Gateway>::all(client.clone()), watcher::Config::default());
    let cache = controller.store();

    let by_class = cache.clone();
    let controller = controller.watches(
        Api::<GatewayClass>::all(client.clone()),
        watcher::Config::default(),
        move |class: GatewayClass| gateways_of_class(&by_class, &class),
    );

    spawn("Gateway", controller, shutdown, ctx, |gateway, ctx| async move {
        if let Some(id) = ResourceId::of(&*gateway) {
            ctx.driver.reconcile_gateway(&id).await?;
        }
        Ok(Action::await_change())
    });
    cache
}

/// Releases the addresses of deleted Gateways. Gateways are never
/// reconciled once they are gone, so every Gateway change sweeps the ledger
/// for owners that no longer exist.
pub(crate) fn ledger(
    client: &Client,
    ledger: &ResourceId,
    gateways: Cache<Gateway>,
    ctx: Arc<Context>,
    shutdown: drain::Watch,
) {
    let controller = Controller::new(
        Api::<ConfigMap>::namespaced(client.clone(), &ledger.namespace),
        watcher::Config::default().fields(&format!("metadata.name={}", ledger.name)),
    );

    let ledger_ref = ObjectRef::<ConfigMap>::new(&ledger.name).within(&ledger.namespace);
    let controller = controller.watches(
        Api::<Gateway>::all(client.clone()),
        watcher::Config::default(),
        move |_: Gateway| Some(ledger_ref.clone()),
    );

    spawn("Ledger", controller, shutdown, ctx, move |ledger, ctx| {
        let gateways = gateways.clone();
        async move {
            if gateways.wait_until_ready().await.is_err() {
                return Ok(Action::await_change());
            }
            for owner in ledger_owners(&ledger) {
                let gateway = ObjectRef::new(&owner.name).within(&owner.namespace);
                if gateways.get(&gateway).is_none() {
                    // The driver reads the Gateway again before releasing.
                    ctx.driver.reconcile_gateway(&owner).await?;
                }
            }
            Ok(Action::await_change())
        }
    });
}

/// Binds routes of kind `R` to their Gateways. Changes to a referenced
/// Gateway, to a referenced backend, or to one of the route's Endpoints
/// reconcile the route again.
pub(crate) fn routes<R>(client: &Client, ctx: Arc<Context>, shutdown: drain::Watch) -> Cache<R>
where
    R: Route + Namespaced,
{
    let controller = Controller::new(Api::<R>::all(client.clone()), watcher::Config::default());
    let cache = controller.store();

    let by_gateway = cache.clone();
    let by_service = cache.clone();
    let controller_name = ctx.controller_name.clone();
    let controller = controller
        .watches(
            Api::<Gateway>::all(client.clone()),
            watcher::Config::default(),
            move |gateway: Gateway| routes_of_gateway(&by_gateway, &gateway),
        )
        .watches(
            Api::<Service>::all(client.clone()),
            watcher::Config::default(),
            move |service: Service| routes_of_service(&by_service, &service, &controller_name),
        );

    spawn(&R::kind(&()), controller, shutdown, ctx, |route, ctx| async move {
        if let Some(id) = ResourceId::of(&*route) {
            ctx.driver.reconcile_route::<R>(&id).await?;
        }
        Ok(Action::await_change())
    });
    cache
}

/// Deletes the Endpoints of deleted routes. Routes are never reconciled once
/// they are gone, so the deletion of a route reconciles its Endpoints, and an
/// Endpoint whose route no longer exists retracts that route.
pub(crate) fn endpoints(
    client: &Client,
    implementation: &str,
    tcp_routes: Option<Cache<TCPRoute>>,
    udp_routes: Option<Cache<UDPRoute>>,
    ctx: Arc<Context>,
    shutdown: drain::Watch,
) {
    let mut controller = Controller::new(
        Api::<Service>::all(client.clone()),
        watcher::Config::default().labels(&format!("{}={implementation}", labels::IMPLEMENTATION)),
    );
    if tcp_routes.is_some() {
        controller = controller.watches(
            Api::<TCPRoute>::all(client.clone()),
            watcher::Config::default(),
            |route: TCPRoute| endpoints_of_route(&route),
        );
    }
    if udp_routes.is_some() {
        controller = controller.watches(
            Api::<UDPRoute>::all(client.clone()),
            watcher::Config::default(),
            |route: UDPRoute| endpoints_of_route(&route),
        );
    }

    spawn("Endpoint", controller, shutdown, ctx, move |endpoint, ctx| {
        let tcp_routes = tcp_routes.clone();
        let udp_routes = udp_routes.clone();
        async move {
            if let Some(routes) = tcp_routes {
                retract_orphaned(&endpoint, &routes, &ctx).await?;
            }
            if let Some(routes) = udp_routes {
                retract_orphaned(&endpoint, &routes, &ctx).await?;
            }
            Ok(Action::await_change())
        }
    });
}

async fn retract_orphaned<R>(endpoint: &Service, routes: &Cache<R>, ctx: &Context) -> Result<(), Error>
where
    R: Route + Namespaced,
{
    let Some(owner) = dependents::endpoint_owner::<R>(endpoint, &ctx.controller_name) else {
        return Ok(());
    };
    if routes.wait_until_ready().await.is_err() {
        return Ok(());
    }
    if routes
        .get(&ObjectRef::new(&owner.name).within(&owner.namespace))
        .is_some()
    {
        return Ok(());
    }
    // The driver reads the route again before retracting.
    ctx.driver.reconcile_route::<R>(&owner).await?;
    Ok(())
}

fn spawn<K, F, Fut>(
    kind: &str,
    controller: Controller<K>,
    shutdown: drain::Watch,
    ctx: Arc<Context>,
    reconcile: F,
) where
    K: Namespaced,
    F: FnMut(Arc<K>, Arc<Context>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Action, Error>> + Send + 'static,
{
    let signaled = shutdown.clone().signaled().map(drop);
    let results = controller
        .graceful_shutdown_on(signaled)
        .run(reconcile, error_policy::<K>, ctx);

    let span = info_span!("controller", %kind);
    tokio::spawn(
        async move {
            results
                .for_each(|result| async move {
                    match result {
                        Ok((obj, _)) => tracing::debug!(%obj, "Reconciled"),
                        // Reported by the error policy.
                        Err(controller::Error::ReconcilerFailed(..)) => {}
                        Err(controller::Error::ObjectNotFound(obj)) => {
                            tracing::debug!(%obj, "No longer exists")
                        }
                        Err(error) => tracing::warn!(%error, "Controller failed"),
                    }
                })
                .await;
            drop(shutdown);
        }
        .instrument(span),
    );
}

fn error_policy<K: Namespaced>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let ns = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    match error {
        Error::Store(_) => tracing::error!(%ns, %name, %error, "Reconciliation failed"),
        _ => tracing::warn!(%ns, %name, %error, "Reconciliation failed"),
    }
    Action::requeue(ctx.requeue_delay)
}

fn gateways_of_class(gateways: &Cache<Gateway>, class: &GatewayClass) -> Vec<ObjectRef<Gateway>> {
    let class = class.name_any();
    gateways
        .state()
        .iter()
        .filter(|gateway| gateway.spec.gateway_class_name == class)
        .map(|gateway| ObjectRef::from_obj(&**gateway))
        .collect()
}

fn routes_of_gateway<R>(routes: &Cache<R>, gateway: &Gateway) -> Vec<ObjectRef<R>>
where
    R: Route + Namespaced,
{
    let Some(id) = ResourceId::of(gateway) else {
        return Vec::new();
    };
    routes
        .state()
        .iter()
        .filter(|route| dependents::references_gateway(&***route, &id))
        .map(|route| ObjectRef::from_obj(&**route))
        .collect()
}

fn routes_of_service<R>(routes: &Cache<R>, service: &Service, controller_name: &str) -> Vec<ObjectRef<R>>
where
    R: Route + Namespaced,
{
    let Some(id) = ResourceId::of(service) else {
        return Vec::new();
    };
    let mut refs = routes
        .state()
        .iter()
        .filter(|route| dependents::references_backend(&***route, &id))
        .map(|route| ObjectRef::from_obj(&**route))
        .collect::<Vec<_>>();
    if let Some(owner) = dependents::endpoint_owner::<R>(service, controller_name) {
        let owner = ObjectRef::new(&owner.name).within(&owner.namespace);
        if !refs.contains(&owner) {
            refs.push(owner);
        }
    }
    refs
}

fn endpoints_of_route<R: Route>(route: &R) -> Vec<ObjectRef<Service>> {
    dependents::route_endpoints(route)
        .into_iter()
        .map(|id| ObjectRef::new(&id.name).within(&id.namespace))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{
        gateway::{
            BackendReference, GatewayClassSpec, GatewaySpec, ParentReference, RouteRule,
            TCPRouteSpec,
        },
        ObjectMeta,
    };
    use kube::runtime::reflector;
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU16;

    const CONTROLLER_NAME: &str = "kube-vip.io/gateway-controller";

    fn mk_gateway(ns: &str, name: &str, class: &str) -> Gateway {
        let mut gateway = Gateway::new(
            name,
            GatewaySpec {
                gateway_class_name: class.to_string(),
                listeners: vec![],
            },
        );
        gateway.metadata.namespace = Some(ns.to_string());
        gateway
    }

    fn mk_route(ns: &str, name: &str, gateway: (&str, &str), backend: (&str, &str)) -> TCPRoute {
        let mut route = TCPRoute::new(
            name,
            TCPRouteSpec {
                parent_refs: Some(vec![ParentReference {
                    group: None,
                    kind: None,
                    namespace: Some(gateway.0.to_string()),
                    name: gateway.1.to_string(),
                    section_name: Some("tcp".to_string()),
                    port: None,
                }]),
                rules: vec![RouteRule {
                    name: None,
                    backend_refs: vec![BackendReference {
                        group: None,
                        kind: None,
                        namespace: Some(backend.0.to_string()),
                        name: backend.1.to_string(),
                        port: NonZeroU16::new(80),
                        weight: None,
                    }],
                }],
            },
        );
        route.metadata.namespace = Some(ns.to_string());
        route
    }

    fn mk_service(ns: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn cache<K: Namespaced>(objects: Vec<K>) -> Cache<K> {
        let (cache, mut writer) = reflector::store();
        for obj in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(obj));
        }
        cache
    }

    fn names<K: Namespaced>(mut refs: Vec<ObjectRef<K>>) -> Vec<String> {
        refs.sort_by_key(|r| r.to_string());
        refs.into_iter()
            .map(|r| format!("{}/{}", r.namespace.unwrap_or_default(), r.name))
            .collect()
    }

    #[test]
    fn gateway_changes_reach_their_routes() {
        let routes = cache(vec![
            mk_route("ns-0", "route-0", ("ns-0", "gw-0"), ("ns-0", "app-0")),
            mk_route("ns-0", "route-1", ("ns-1", "gw-0"), ("ns-0", "app-0")),
            mk_route("ns-1", "route-2", ("ns-0", "gw-0"), ("ns-1", "app-0")),
        ]);
        assert_eq!(
            names(routes_of_gateway(&routes, &mk_gateway("ns-0", "gw-0", "kube-vip"))),
            vec!["ns-0/route-0", "ns-1/route-2"]
        );
        assert!(routes_of_gateway(&routes, &mk_gateway("ns-2", "gw-0", "kube-vip")).is_empty());
    }

    #[test]
    fn service_changes_reach_routes_and_owners() {
        let routes = cache(vec![
            mk_route("ns-0", "route-0", ("ns-0", "gw-0"), ("ns-0", "app-0")),
            mk_route("ns-0", "route-1", ("ns-0", "gw-0"), ("ns-1", "app-1")),
        ]);
        assert_eq!(
            names(routes_of_service(&routes, &mk_service("ns-0", "app-0"), CONTROLLER_NAME)),
            vec!["ns-0/route-0"]
        );

        // An Endpoint reaches its owner even when the route is not cached.
        let mut endpoint = mk_service("ns-1", "app-1-gw-api");
        endpoint.annotations_mut().extend([
            (labels::CONTROLLER_ANNOTATION.to_string(), CONTROLLER_NAME.to_string()),
            ("parent-tcp-route".to_string(), "route-9".to_string()),
            (labels::ROUTE_NAMESPACE_ANNOTATION.to_string(), "ns-0".to_string()),
        ]);
        assert_eq!(
            names(routes_of_service(&routes, &endpoint, CONTROLLER_NAME)),
            vec!["ns-0/route-9"]
        );
    }

    #[test]
    fn route_changes_reach_their_endpoints() {
        let route = mk_route("ns-0", "route-0", ("ns-0", "gw-0"), ("ns-1", "app-1"));
        assert_eq!(names(endpoints_of_route(&route)), vec!["ns-1/app-1-gw-api"]);
    }

    #[test]
    fn class_changes_reach_their_gateways() {
        let gateways = cache(vec![
            mk_gateway("ns-0", "gw-0", "kube-vip"),
            mk_gateway("ns-1", "gw-1", "other"),
        ]);
        let class = GatewayClass::new(
            "kube-vip",
            GatewayClassSpec {
                controller_name: CONTROLLER_NAME.to_string(),
                description: None,
            },
        );
        assert_eq!(names(gateways_of_class(&gateways, &class)), vec!["ns-0/gw-0"]);
    }
}
