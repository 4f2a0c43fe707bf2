use crate::{
    dependents::{endpoint_id, endpoint_owner},
    Config, Error, Parent, Report, ResourceId, Store, StoreError, Unresolved,
};
use gateway_controller_k8s_api::{
    gateway::{BackendReference, Route},
    labels, IntOrString, ObjectMeta, ResourceExt, Selector, Service, ServicePort, ServiceSpec,
};
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    net::IpAddr,
    num::NonZeroU16,
};

const LOAD_BALANCER: &str = "LoadBalancer";

/// A resolved parent together with the address its Gateway holds.
#[derive(Clone, Debug)]
pub struct AddressedParent {
    pub parent: Parent,
    pub address: IpAddr,
}

/// Creates, updates and deletes the Endpoints (load-balancer Services) that
/// expose a route's backends on its Gateways' addresses.
pub struct EndpointSynthesizer<'a, S> {
    store: &'a S,
    config: &'a Config,
}

/// The Endpoint a route wants for one backend.
#[derive(Debug)]
struct Desired {
    gateway: ResourceId,
    address: IpAddr,
    selector: Option<BTreeMap<String, String>>,
    ports: Vec<ServicePort>,
}

/// A backend reference that resolved to an existing Service.
struct Backend {
    id: ResourceId,
    port: NonZeroU16,
    selector: Option<BTreeMap<String, String>>,
}

impl<'a, S: Store> EndpointSynthesizer<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Self {
        Self { store, config }
    }

    /// Brings the route's Endpoints in line with its resolved parents.
    ///
    /// Every backend of every rule is bound to every resolved parent. Backend
    /// references that cannot be bound are recorded in the report and
    /// skipped. Endpoints this route owns that are no longer wanted are
    /// deleted. Object-store failures abort the reconciliation.
    pub async fn reconcile<R: Route>(
        &self,
        route: &R,
        parents: &[AddressedParent],
    ) -> Result<Report, Error> {
        let route_ns = route.namespace().ok_or_else(|| Error::MissingNamespace {
            kind: R::kind(&()).to_string(),
            name: route.name_any(),
        })?;
        let route_name = route.name_any();
        let mut report = Report::default();

        let backends = if parents.is_empty() {
            Vec::new()
        } else {
            self.resolve_backends(route, &route_ns, &mut report).await?
        };

        let mut desired = BTreeMap::<ResourceId, Desired>::new();
        for AddressedParent { parent, address } in parents {
            let gateway = parent.gateway_id();
            for backend in &backends {
                let endpoint = endpoint_id(&backend.id);
                let port = service_port(R::PROTOCOL, parent.listener.port, backend.port);
                match desired.entry(endpoint) {
                    Entry::Vacant(entry) => {
                        entry.insert(Desired {
                            gateway: gateway.clone(),
                            address: *address,
                            selector: backend.selector.clone(),
                            ports: vec![port],
                        });
                    }
                    Entry::Occupied(mut entry) if entry.get().gateway == gateway => {
                        let ports = &mut entry.get_mut().ports;
                        if !ports.iter().any(|p| p.port == port.port) {
                            ports.push(port);
                        }
                    }
                    Entry::Occupied(entry) => {
                        report.unresolved.push(Unresolved::ShadowedParent {
                            endpoint: entry.key().clone(),
                            gateway: gateway.clone(),
                        });
                    }
                }
            }
        }

        let wanted = desired.keys().cloned().collect::<BTreeSet<_>>();
        for (id, desired) in desired {
            self.apply::<R>(&route_name, &route_ns, id, desired, &mut report)
                .await?;
        }

        for endpoint in self.owned::<R>(&route_name, &route_ns).await? {
            let Some(id) = ResourceId::of(&endpoint) else {
                continue;
            };
            if wanted.contains(&id) {
                continue;
            }
            self.store.delete::<Service>(&id.namespace, &id.name).await?;
            tracing::info!(route = %route_name, endpoint = %id, "Pruned endpoint");
            report.pruned.push(id);
        }

        Ok(report)
    }

    /// Deletes every Endpoint owned by the named route.
    pub async fn retract<R: Route>(
        &self,
        route_name: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceId>, Error> {
        let mut retracted = Vec::new();
        for endpoint in self.owned::<R>(route_name, namespace).await? {
            let Some(id) = ResourceId::of(&endpoint) else {
                continue;
            };
            self.store.delete::<Service>(&id.namespace, &id.name).await?;
            tracing::info!(route = %route_name, endpoint = %id, "Retracted endpoint");
            retracted.push(id);
        }
        Ok(retracted)
    }

    async fn resolve_backends<R: Route>(
        &self,
        route: &R,
        route_ns: &str,
        report: &mut Report,
    ) -> Result<Vec<Backend>, Error> {
        let mut backends = Vec::new();
        for backend_ref in route.backend_refs() {
            let id = ResourceId::new(backend_ref.namespace_or(route_ns), &backend_ref.name);
            match self.resolve_backend(backend_ref, &id).await? {
                Ok(backend) => backends.push(backend),
                Err(unresolved) => report.unresolved.push(unresolved),
            }
        }
        Ok(backends)
    }

    async fn resolve_backend(
        &self,
        backend_ref: &BackendReference,
        id: &ResourceId,
    ) -> Result<Result<Backend, Unresolved>, Error> {
        if !backend_ref.targets_service() {
            return Ok(Err(Unresolved::UnsupportedBackendKind {
                backend: id.clone(),
            }));
        }
        let Some(port) = backend_ref.port else {
            return Ok(Err(Unresolved::MissingBackendPort {
                backend: id.clone(),
            }));
        };
        let Some(service) = self.store.get::<Service>(&id.namespace, &id.name).await? else {
            return Ok(Err(Unresolved::BackendNotFound {
                backend: id.clone(),
            }));
        };
        Ok(Ok(Backend {
            id: id.clone(),
            port,
            selector: service.spec.and_then(|s| s.selector),
        }))
    }

    async fn apply<R: Route>(
        &self,
        route_name: &str,
        route_ns: &str,
        id: ResourceId,
        desired: Desired,
        report: &mut Report,
    ) -> Result<(), Error> {
        match self.store.get::<Service>(&id.namespace, &id.name).await? {
            None => {
                let mut endpoint = Service {
                    metadata: ObjectMeta {
                        namespace: Some(id.namespace.clone()),
                        name: Some(id.name.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.stamp::<R>(&mut endpoint, route_name, route_ns, desired);
                match self.store.create(&endpoint).await {
                    Ok(_) => {
                        tracing::info!(route = %route_name, endpoint = %id, "Created endpoint");
                        report.created.push(id);
                    }
                    // Created since it was read; it is examined on the next pass.
                    Err(StoreError::AlreadyExists(resource)) => {
                        return Err(Error::Conflict { resource });
                    }
                    Err(error) => return Err(error.into()),
                }
            }

            Some(existing) if !self.owns::<R>(&existing, route_name, route_ns) => {
                tracing::warn!(route = %route_name, endpoint = %id, "Endpoint exists and is owned elsewhere");
                report
                    .unresolved
                    .push(Unresolved::ForeignEndpoint { endpoint: id });
            }

            Some(existing) => {
                let mut endpoint = existing.clone();
                self.stamp::<R>(&mut endpoint, route_name, route_ns, desired);
                if endpoint == existing {
                    report.unchanged.push(id);
                } else {
                    self.store.replace(&endpoint).await?;
                    tracing::info!(route = %route_name, endpoint = %id, "Updated endpoint");
                    report.updated.push(id);
                }
            }
        }
        Ok(())
    }

    /// Writes the desired state onto an Endpoint, leaving fields this
    /// controller does not manage as they are.
    fn stamp<R: Route>(
        &self,
        endpoint: &mut Service,
        route_name: &str,
        route_ns: &str,
        desired: Desired,
    ) {
        let address = desired.address.to_string();

        let meta_labels = endpoint.labels_mut();
        meta_labels.insert(
            labels::IMPLEMENTATION.to_string(),
            self.config.implementation.clone(),
        );
        meta_labels.insert(labels::IPAM_ADDRESS.to_string(), address.clone());

        let annotations = endpoint.annotations_mut();
        annotations.insert(
            labels::CONTROLLER_ANNOTATION.to_string(),
            self.config.controller_name.clone(),
        );
        annotations.insert(R::OWNER_ANNOTATION.to_string(), route_name.to_string());
        annotations.insert(
            labels::ROUTE_NAMESPACE_ANNOTATION.to_string(),
            route_ns.to_string(),
        );

        let spec = endpoint.spec.get_or_insert_with(ServiceSpec::default);
        let mut ports = desired.ports;
        for port in &mut ports {
            // Node ports are assigned by the API server and must survive
            // updates.
            port.node_port = spec
                .ports
                .iter()
                .flatten()
                .find(|p| p.port == port.port && p.protocol == port.protocol)
                .and_then(|p| p.node_port);
        }
        spec.type_ = Some(LOAD_BALANCER.to_string());
        spec.selector = desired.selector;
        spec.ports = Some(ports);
        spec.load_balancer_ip = Some(address);
    }

    /// Lists the Endpoints the named route owns: those in the route's
    /// namespace and those elsewhere that carry the implementation label.
    async fn owned<R: Route>(
        &self,
        route_name: &str,
        route_ns: &str,
    ) -> Result<Vec<Service>, Error> {
        let local = self
            .store
            .list::<Service>(Some(route_ns), &Selector::default())
            .await?;
        let labeled = self
            .store
            .list::<Service>(
                None,
                &Selector::from_iter([(labels::IMPLEMENTATION, &*self.config.implementation)]),
            )
            .await?;

        let mut seen = BTreeSet::new();
        Ok(local
            .into_iter()
            .chain(labeled)
            .filter(|svc| self.owns::<R>(svc, route_name, route_ns))
            .filter(|svc| seen.insert(ResourceId::of(svc)))
            .collect())
    }

    fn owns<R: Route>(&self, endpoint: &Service, route_name: &str, route_ns: &str) -> bool {
        endpoint_owner::<R>(endpoint, &self.config.controller_name)
            .is_some_and(|owner| owner.namespace == route_ns && owner.name == route_name)
    }
}

fn service_port(protocol: &str, listener_port: NonZeroU16, target_port: NonZeroU16) -> ServicePort {
    ServicePort {
        name: Some(format!("{}-{listener_port}", protocol.to_ascii_lowercase())),
        protocol: Some(protocol.to_string()),
        port: listener_port.get().into(),
        target_port: Some(IntOrString::Int(target_port.get().into())),
        ..Default::default()
    }
}
