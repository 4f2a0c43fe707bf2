#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod allocate;
pub mod pool;

pub use self::{
    allocate::{allocate, parse_addresses, unique_addresses, AddressSet, Exhausted},
    pool::{Block, Kind, PoolConfig, PoolSpec, Scope},
};
