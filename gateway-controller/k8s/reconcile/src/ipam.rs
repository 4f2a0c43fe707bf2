use crate::{Config, Error, ResourceId, Store, StoreError};
use gateway_controller_core::{
    allocate, parse_addresses, unique_addresses, AddressSet, Exhausted, PoolConfig, PoolSpec,
    Scope,
};
use gateway_controller_k8s_api::{
    gateway::Gateway, labels, ConfigMap, ObjectMeta, ResourceExt, Selector, Service,
};
use std::{collections::BTreeMap, net::IpAddr};

/// Bounds how many times a claim or release re-reads the ledger after losing
/// a write to a concurrent reconciliation.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Records which Gateway holds which address.
///
/// The ledger is a ConfigMap mapping `<namespace>.<gateway>` to an address.
/// Every write is conditioned on the resource version that was read, so two
/// reconciliations that pick the same free address cannot both record it:
/// the loser re-reads the ledger and picks again.
pub struct Ledger<'a, S> {
    store: &'a S,
    config: &'a Config,
}

/// An address claimed for a Gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    pub address: IpAddr,
    /// The pool the address was newly allocated from, if it was not already
    /// held.
    pub allocated_from: Option<PoolSpec>,
}

fn owner_key(namespace: &str, name: &str) -> String {
    // Namespaces cannot contain dots, so the first dot separates the parts.
    format!("{namespace}.{name}")
}

/// Lists the Gateways that hold an address in a ledger.
pub fn ledger_owners(ledger: &ConfigMap) -> Vec<ResourceId> {
    ledger
        .data
        .iter()
        .flatten()
        .filter_map(|(owner, _)| owner.split_once('.'))
        .map(|(namespace, name)| ResourceId::new(namespace, name))
        .collect()
}

impl<'a, S: Store> Ledger<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Self {
        Self { store, config }
    }

    /// Returns the Gateway's address, claiming one if it holds none.
    ///
    /// An address already recorded on the Gateway's label is kept if it lies
    /// in the pool configured for the Gateway's namespace and nothing else
    /// holds it. Otherwise the pool's next free address is taken.
    pub async fn claim(&self, gateway: &Gateway) -> Result<Claim, Error> {
        let namespace = gateway
            .namespace()
            .ok_or_else(|| Error::MissingNamespace {
                kind: "Gateway".to_string(),
                name: gateway.name_any(),
            })?;
        let name = gateway.name_any();
        let owner = owner_key(&namespace, &name);

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let (mut ledger, exists) = self.load().await?;
            let entries = ledger.data.get_or_insert_with(BTreeMap::new);

            if let Some(address) = entries.get(&owner).and_then(|a| a.parse().ok()) {
                return Ok(Claim {
                    address,
                    allocated_from: None,
                });
            }

            let pool = self.pool(&namespace).await?;
            let gateway_id = ResourceId::new(&namespace, &name);
            let used = self
                .addresses_in_use(&pool.scope, entries.values(), Some(&gateway_id))
                .await?;

            let labeled = gateway
                .labels()
                .get(labels::IPAM_ADDRESS)
                .and_then(|a| a.parse::<IpAddr>().ok())
                .filter(|a| pool.contains(a) && !used.contains(a));

            let (address, allocated_from) = match labeled {
                Some(address) => {
                    tracing::debug!(%namespace, gateway = %name, %address, "Recording labeled address");
                    (address, None)
                }
                None => {
                    let address = allocate(&pool, &used).map_err(|Exhausted { pool }| {
                        Error::PoolExhausted {
                            namespace: namespace.clone(),
                            pool,
                        }
                    })?;
                    (address, Some(pool))
                }
            };

            entries.insert(owner.clone(), address.to_string());
            let written = if exists {
                self.store.replace(&ledger).await
            } else {
                self.store.create(&ledger).await
            };
            match written {
                Ok(_) => {
                    tracing::info!(%namespace, gateway = %name, %address, "Claimed address");
                    return Ok(Claim {
                        address,
                        allocated_from,
                    });
                }
                Err(StoreError::Conflict(_) | StoreError::AlreadyExists(_)) => {
                    tracing::debug!(%namespace, gateway = %name, %address, attempt, "Lost ledger write; retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(Error::Conflict {
            resource: self.describe(),
        })
    }

    /// Releases the Gateway's claim, returning the address it held.
    pub async fn release(&self, namespace: &str, name: &str) -> Result<Option<IpAddr>, Error> {
        let owner = owner_key(namespace, name);

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let Some(mut ledger) = self
                .store
                .get::<ConfigMap>(&self.config.ledger.namespace, &self.config.ledger.name)
                .await?
            else {
                return Ok(None);
            };
            let Some(address) = ledger.data.as_mut().and_then(|d| d.remove(&owner)) else {
                return Ok(None);
            };

            match self.store.replace(&ledger).await {
                Ok(_) => {
                    tracing::info!(%namespace, gateway = %name, %address, "Released address");
                    return Ok(address.parse().ok());
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(%namespace, gateway = %name, attempt, "Lost ledger write; retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(Error::Conflict {
            resource: self.describe(),
        })
    }

    /// Collects every address in use within a pool scope: the ledger's claims
    /// plus the `ipam-address` labels of this implementation's Gateways and
    /// Endpoints. The label scan covers the pool's namespace for namespaced
    /// pools and all namespaces for the global pool.
    pub async fn used_addresses<'l>(
        &self,
        scope: &Scope,
        claimed: impl IntoIterator<Item = &'l String>,
    ) -> Result<AddressSet, Error> {
        self.addresses_in_use(scope, claimed, None).await
    }

    /// Like `used_addresses`, but ignores the labels of the Gateway being
    /// addressed.
    async fn addresses_in_use<'l>(
        &self,
        scope: &Scope,
        claimed: impl IntoIterator<Item = &'l String>,
        except: Option<&ResourceId>,
    ) -> Result<AddressSet, Error> {
        let selector = Selector::from_iter([(labels::IMPLEMENTATION, &*self.config.implementation)]);
        let namespace = match scope {
            Scope::Namespace(ns) => Some(ns.as_str()),
            Scope::Global => None,
        };

        let mut gateways = self.store.list::<Gateway>(namespace, &selector).await?;
        if let Some(except) = except {
            gateways.retain(|gw| ResourceId::of(gw).as_ref() != Some(except));
        }
        let endpoints = self.store.list::<Service>(namespace, &selector).await?;

        let addresses = unique_addresses([
            claimed.into_iter().cloned().collect::<Vec<_>>(),
            labeled_addresses(&gateways),
            labeled_addresses(&endpoints),
        ]);
        Ok(parse_addresses(addresses))
    }

    /// Reads the pool configuration and selects the pool for `namespace`.
    async fn pool(&self, namespace: &str) -> Result<PoolSpec, Error> {
        let id = &self.config.pool_config;
        let data = self
            .store
            .get::<ConfigMap>(&id.namespace, &id.name)
            .await?
            .and_then(|cm| cm.data);
        let Some(data) = data else {
            tracing::warn!(%namespace, config = %id, "Address pool configuration not found");
            return Err(Error::NotConfigured {
                namespace: namespace.to_string(),
            });
        };

        PoolConfig::from_data(data).resolve(namespace).map_err(|error| {
            tracing::warn!(%namespace, config = %id, %error, "No usable address pool");
            error.into()
        })
    }

    /// Reads the ledger. Returns an empty, unsaved ledger if none exists.
    async fn load(&self) -> Result<(ConfigMap, bool), Error> {
        let id = &self.config.ledger;
        match self.store.get::<ConfigMap>(&id.namespace, &id.name).await? {
            Some(ledger) => Ok((ledger, true)),
            None => {
                let ledger = ConfigMap {
                    metadata: ObjectMeta {
                        namespace: Some(id.namespace.clone()),
                        name: Some(id.name.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                Ok((ledger, false))
            }
        }
    }

    fn describe(&self) -> String {
        format!("ConfigMap {}", self.config.ledger)
    }
}

fn labeled_addresses<K: ResourceExt>(objects: &[K]) -> Vec<String> {
    objects
        .iter()
        .filter_map(|o| o.labels().get(labels::IPAM_ADDRESS).cloned())
        .collect()
}
