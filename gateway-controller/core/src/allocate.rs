use crate::pool::PoolSpec;
use std::{collections::BTreeSet, net::IpAddr};

pub type AddressSet = ahash::AHashSet<IpAddr>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("address pool {pool} is exhausted")]
pub struct Exhausted {
    pub pool: String,
}

/// Picks the first address in `pool` that is not in `used`.
///
/// Blocks are scanned in the order they were configured and addresses in
/// ascending order within each block, so the result is deterministic for a
/// given pool and usage set.
pub fn allocate(pool: &PoolSpec, used: &AddressSet) -> Result<IpAddr, Exhausted> {
    pool.hosts()
        .find(|addr| !used.contains(addr))
        .ok_or_else(|| Exhausted {
            pool: pool.key.clone(),
        })
}

/// Merges address lists into a sorted list of distinct, non-empty values.
pub fn unique_addresses<I, L, S>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = L>,
    L: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lists
        .into_iter()
        .flatten()
        .filter_map(|addr| {
            let addr = addr.as_ref().trim();
            (!addr.is_empty()).then(|| addr.to_string())
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Parses recorded address values, skipping any that are not address
/// literals.
pub fn parse_addresses<I, S>(addrs: I) -> AddressSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    addrs
        .into_iter()
        .filter_map(|addr| match addr.as_ref().parse::<IpAddr>() {
            Ok(addr) => Some(addr),
            Err(error) => {
                tracing::debug!(addr = %addr.as_ref(), %error, "Ignoring invalid address");
                None
            }
        })
        .collect()
}
