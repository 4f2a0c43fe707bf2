use crate::{Error, ResourceId, Store, Unresolved};
use gateway_controller_k8s_api::{
    gateway::{Gateway, GatewayClass, Listener, Route},
    ResourceExt,
};

/// A Gateway listener a route is attached to.
#[derive(Clone, Debug)]
pub struct Parent {
    pub gateway: Gateway,
    pub listener: Listener,
}

#[derive(Clone, Debug)]
pub enum ParentResolution {
    Resolved(Parent),
    Unresolved(Unresolved),
}

/// Resolves a route's parent references to Gateway listeners.
pub struct ParentResolver<'a, S> {
    store: &'a S,
    controller_name: &'a str,
}

// === impl Parent ===

impl Parent {
    pub fn gateway_id(&self) -> ResourceId {
        ResourceId::new(
            self.gateway.namespace().unwrap_or_default(),
            self.gateway.name_any(),
        )
    }
}

// === impl ParentResolver ===

impl<'a, S: Store> ParentResolver<'a, S> {
    pub fn new(store: &'a S, controller_name: &'a str) -> Self {
        Self {
            store,
            controller_name,
        }
    }

    /// Yields one resolution per parent reference, in order.
    ///
    /// Only object-store failures are returned as errors; a reference that
    /// does not resolve never prevents the others from resolving.
    pub async fn resolve<R: Route>(
        &self,
        route: &R,
        route_namespace: &str,
    ) -> Result<Vec<ParentResolution>, Error> {
        let mut resolutions = Vec::with_capacity(route.parent_refs().len());

        for parent_ref in route.parent_refs() {
            let id = ResourceId::new(parent_ref.namespace_or(route_namespace), &parent_ref.name);
            if !parent_ref.targets_gateway() {
                resolutions.push(ParentResolution::Unresolved(
                    Unresolved::UnsupportedParentKind { parent: id },
                ));
                continue;
            }

            let gateway = match self.store.get::<Gateway>(&id.namespace, &id.name).await? {
                Some(gateway) => gateway,
                None => {
                    resolutions.push(ParentResolution::Unresolved(Unresolved::GatewayNotFound {
                        gateway: id,
                    }));
                    continue;
                }
            };

            if !self.manages(&gateway).await? {
                resolutions.push(ParentResolution::Unresolved(
                    Unresolved::ForeignGatewayClass {
                        gateway: id,
                        class: gateway.spec.gateway_class_name.clone(),
                    },
                ));
                continue;
            }

            let Some(section_name) = parent_ref.section_name.as_deref() else {
                resolutions.push(ParentResolution::Unresolved(
                    Unresolved::MissingSectionName { gateway: id },
                ));
                continue;
            };

            let resolution = match gateway.listener(section_name).cloned() {
                Some(listener) => ParentResolution::Resolved(Parent { gateway, listener }),
                None => ParentResolution::Unresolved(Unresolved::ListenerNotFound {
                    gateway: id,
                    section_name: section_name.to_string(),
                }),
            };
            resolutions.push(resolution);
        }

        Ok(resolutions)
    }

    /// Checks that the Gateway's class names this controller.
    pub async fn manages(&self, gateway: &Gateway) -> Result<bool, Error> {
        let class = &gateway.spec.gateway_class_name;
        match self.store.get_cluster::<GatewayClass>(class).await? {
            Some(gc) => Ok(gc.spec.controller_name == self.controller_name),
            None => {
                tracing::debug!(%class, "GatewayClass not found");
                Ok(false)
            }
        }
    }
}
