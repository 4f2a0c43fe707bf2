#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dependents;
mod driver;
mod endpoint;
mod error;
mod ipam;
mod metrics;
mod parent;
mod report;
mod resource_id;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    driver::{Config, Driver, Outcome},
    endpoint::{AddressedParent, EndpointSynthesizer},
    error::Error,
    ipam::{ledger_owners, Claim, Ledger},
    metrics::DriverMetrics,
    parent::{Parent, ParentResolution, ParentResolver},
    report::{Report, Unresolved},
    resource_id::ResourceId,
    store::{ClusterScoped, KubeStore, Namespaced, Store, StoreError},
};
