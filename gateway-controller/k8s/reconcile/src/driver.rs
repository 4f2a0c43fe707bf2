use crate::{
    ipam::Ledger, AddressedParent, DriverMetrics, EndpointSynthesizer, Error, Namespaced,
    ParentResolution, ParentResolver, Report, ResourceId, Store, StoreError,
};
use gateway_controller_k8s_api::{
    gateway::{Gateway, Route},
    labels, ResourceExt,
};
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};
use tracing::{info_span, Instrument};

/// Bounds how many times the Gateway's address labels are rewritten after a
/// concurrent modification of the Gateway.
const MAX_STAMP_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The GatewayClass controller name this controller serves. Also stamped
    /// on every Endpoint it owns.
    pub controller_name: String,

    /// The value of the `implementation` label.
    pub implementation: String,

    /// The ConfigMap holding the address pools.
    pub pool_config: ResourceId,

    /// The ConfigMap recording which Gateway holds which address.
    pub ledger: ResourceId,
}

/// Runs one reconciliation per invocation.
///
/// Invocations for different keys may run concurrently. Every invocation is
/// idempotent, so a failed one may simply be delivered again.
#[derive(Clone)]
pub struct Driver<S> {
    store: S,
    config: Arc<Config>,
    metrics: DriverMetrics,
}

/// What an invocation did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The route exists and its Endpoints were brought up to date.
    Synced(Report),
    /// The route no longer exists and these Endpoints were deleted.
    Retracted(Vec<ResourceId>),
    /// The Gateway exists and holds this address.
    Addressed(IpAddr),
    /// The Gateway no longer exists and released its address, if it held one.
    Released(Option<IpAddr>),
    /// The Gateway is not managed by this controller.
    Ignored,
}

impl<S: Store> Driver<S> {
    pub fn new(store: S, config: Config, metrics: DriverMetrics) -> Self {
        Self {
            store,
            config: Arc::new(config),
            metrics,
        }
    }

    /// Ensures that a managed Gateway holds an address, or releases the
    /// address of a deleted one.
    pub async fn reconcile_gateway(&self, id: &ResourceId) -> Result<Outcome, Error> {
        let span = info_span!("gateway", ns = %id.namespace, name = %id.name);
        let result = self.sync_gateway(id).instrument(span).await;
        self.metrics.record("Gateway", &result);
        result
    }

    /// Brings a route's Endpoints up to date, or deletes them if the route no
    /// longer exists.
    pub async fn reconcile_route<R>(&self, id: &ResourceId) -> Result<Outcome, Error>
    where
        R: Route + Namespaced,
    {
        let kind = R::kind(&());
        let span = info_span!("route", %kind, ns = %id.namespace, name = %id.name);
        let result = self.sync_route::<R>(id).instrument(span).await;
        self.metrics.record(&kind, &result);
        result
    }

    async fn sync_gateway(&self, id: &ResourceId) -> Result<Outcome, Error> {
        let Some(gateway) = self.store.get::<Gateway>(&id.namespace, &id.name).await? else {
            let released = Ledger::new(&self.store, &self.config)
                .release(&id.namespace, &id.name)
                .await?;
            return Ok(Outcome::Released(released));
        };

        let resolver = ParentResolver::new(&self.store, &self.config.controller_name);
        if !resolver.manages(&gateway).await? {
            // The Gateway may have moved to another class since it was addressed.
            let released = Ledger::new(&self.store, &self.config)
                .release(&id.namespace, &id.name)
                .await?;
            self.unstamp(&gateway).await?;
            if released.is_some() {
                return Ok(Outcome::Released(released));
            }
            tracing::debug!(class = %gateway.spec.gateway_class_name, "Ignoring gateway");
            return Ok(Outcome::Ignored);
        }

        let address = self.ensure_address(gateway).await?;
        Ok(Outcome::Addressed(address))
    }

    async fn sync_route<R>(&self, id: &ResourceId) -> Result<Outcome, Error>
    where
        R: Route + Namespaced,
    {
        let synthesizer = EndpointSynthesizer::new(&self.store, &self.config);

        let Some(route) = self.store.get::<R>(&id.namespace, &id.name).await? else {
            let retracted = synthesizer.retract::<R>(&id.name, &id.namespace).await?;
            return Ok(Outcome::Retracted(retracted));
        };

        let resolver = ParentResolver::new(&self.store, &self.config.controller_name);
        let mut unresolved = Vec::new();
        let mut parents = Vec::new();
        let mut addresses = BTreeMap::<ResourceId, IpAddr>::new();
        for resolution in resolver.resolve(&route, &id.namespace).await? {
            let parent = match resolution {
                ParentResolution::Resolved(parent) => parent,
                ParentResolution::Unresolved(reason) => {
                    unresolved.push(reason);
                    continue;
                }
            };

            let gateway_id = parent.gateway_id();
            let address = match addresses.get(&gateway_id) {
                Some(address) => *address,
                None => {
                    let address = self.ensure_address(parent.gateway.clone()).await?;
                    addresses.insert(gateway_id, address);
                    address
                }
            };
            parents.push(AddressedParent { parent, address });
        }

        let mut report = synthesizer.reconcile(&route, &parents).await?;
        unresolved.append(&mut report.unresolved);
        report.unresolved = unresolved;

        for reason in &report.unresolved {
            tracing::info!(%reason, "Reference not bound");
        }
        tracing::debug!(
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            pruned = report.pruned.len(),
            "Synced"
        );
        Ok(Outcome::Synced(report))
    }

    /// Claims the Gateway's address and records it on the Gateway's labels.
    async fn ensure_address(&self, mut gateway: Gateway) -> Result<IpAddr, Error> {
        let namespace = gateway.namespace().unwrap_or_default();
        let name = gateway.name_any();

        let claim = match Ledger::new(&self.store, &self.config).claim(&gateway).await {
            Ok(claim) => claim,
            Err(error) => {
                match &error {
                    Error::NotConfigured { .. } | Error::InvalidPool { .. } => {
                        tracing::warn!(%namespace, gateway = %name, config = %self.config.pool_config, %error, "Cannot allocate an address");
                    }
                    Error::PoolExhausted { pool, .. } => {
                        tracing::warn!(%namespace, gateway = %name, %pool, "Address pool exhausted");
                    }
                    _ => {}
                }
                return Err(error);
            }
        };
        if let Some(pool) = &claim.allocated_from {
            tracing::info!(%namespace, gateway = %name, address = %claim.address, pool = %pool.key, "Allocated address");
            self.metrics.allocated(pool.kind);
        }

        let address = claim.address.to_string();
        for _ in 0..MAX_STAMP_ATTEMPTS {
            let current = gateway.labels();
            if current.get(labels::IPAM_ADDRESS) == Some(&address)
                && current.get(labels::IMPLEMENTATION) == Some(&self.config.implementation)
            {
                return Ok(claim.address);
            }

            let stamp = BTreeMap::from([
                (
                    labels::IMPLEMENTATION.to_string(),
                    Some(self.config.implementation.clone()),
                ),
                (labels::IPAM_ADDRESS.to_string(), Some(address.clone())),
            ]);
            match self
                .store
                .patch_labels::<Gateway>(&namespace, &name, gateway.resource_version(), stamp)
                .await
            {
                Ok(_) => {
                    tracing::debug!(%namespace, gateway = %name, %address, "Labeled gateway");
                    return Ok(claim.address);
                }
                Err(StoreError::Conflict(_)) => {
                    match self.store.get::<Gateway>(&namespace, &name).await? {
                        Some(latest) => gateway = latest,
                        // Its deletion releases the claim.
                        None => return Ok(claim.address),
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(Error::Conflict {
            resource: format!("Gateway {namespace}/{name}"),
        })
    }

    /// Removes the address labels this controller stamped on a Gateway.
    async fn unstamp(&self, gateway: &Gateway) -> Result<(), Error> {
        let stamped = gateway.labels().get(labels::IMPLEMENTATION)
            == Some(&self.config.implementation);
        if !stamped {
            return Ok(());
        }

        let namespace = gateway.namespace().unwrap_or_default();
        let name = gateway.name_any();
        let unset = BTreeMap::from([
            (labels::IMPLEMENTATION.to_string(), None),
            (labels::IPAM_ADDRESS.to_string(), None),
        ]);
        self.store
            .patch_labels::<Gateway>(&namespace, &name, gateway.resource_version(), unset)
            .await?;
        tracing::debug!(%namespace, gateway = %name, "Removed address labels");
        Ok(())
    }
}
