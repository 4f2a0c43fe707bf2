use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};
use std::{collections::BTreeMap, fmt, net::IpAddr};

const CIDR_PREFIX: &str = "cidr";
const RANGE_PREFIX: &str = "range";
const GLOBAL: &str = "global";

/// Address pool configuration, as read from the pool ConfigMap's data.
///
/// Keys take the form `cidr-<namespace>`, `cidr-global`, `range-<namespace>`
/// and `range-global`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolConfig {
    data: BTreeMap<String, String>,
}

/// The pool selected for a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSpec {
    pub kind: Kind,
    pub scope: Scope,
    /// The configuration key the pool was read from.
    pub key: String,
    blocks: Vec<Block>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Cidr,
    Range,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Namespace(String),
    Global,
}

/// A contiguous set of allocatable addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Block {
    Net(IpNet),
    Range { start: IpAddr, end: IpAddr },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no address pool configured for namespace {namespace} (looked for cidr-{namespace}, cidr-global, range-{namespace}, range-global)")]
    NotConfigured { namespace: String },

    #[error("invalid pool {key}={value:?}: {reason}")]
    InvalidPool {
        key: String,
        value: String,
        reason: String,
    },
}

// === impl PoolConfig ===

impl PoolConfig {
    pub fn from_data(data: BTreeMap<String, String>) -> Self {
        Self { data }
    }

    /// Selects the pool for `namespace`.
    ///
    /// CIDR pools always take precedence over range pools: the namespaced
    /// CIDR is consulted first, then the global CIDR, and only when neither
    /// exists are the namespaced and global ranges consulted, in that order.
    pub fn resolve(&self, namespace: &str) -> Result<PoolSpec, Error> {
        let lookups = [
            (Kind::Cidr, Scope::Namespace(namespace.to_string())),
            (Kind::Cidr, Scope::Global),
            (Kind::Range, Scope::Namespace(namespace.to_string())),
            (Kind::Range, Scope::Global),
        ];

        for (kind, scope) in lookups {
            let key = kind.key(&scope);
            match self.data.get(&key) {
                Some(value) => {
                    tracing::debug!(%namespace, pool = %key, "Taking address from pool");
                    let blocks = parse_blocks(kind, &key, value)?;
                    return Ok(PoolSpec {
                        kind,
                        scope,
                        key,
                        blocks,
                    });
                }
                None => tracing::trace!(%namespace, pool = %key, "No pool configured"),
            }
        }

        Err(Error::NotConfigured {
            namespace: namespace.to_string(),
        })
    }
}

impl FromIterator<(String, String)> for PoolConfig {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_data(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for PoolConfig {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

fn parse_blocks(kind: Kind, key: &str, value: &str) -> Result<Vec<Block>, Error> {
    let invalid = |reason: String| Error::InvalidPool {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };

    let blocks = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|spec| match kind {
            Kind::Cidr => Block::parse_cidr(spec),
            Kind::Range => Block::parse_range(spec),
        })
        .collect::<Result<Vec<_>, String>>()
        .map_err(invalid)?;

    if blocks.is_empty() {
        return Err(invalid("no addresses listed".to_string()));
    }
    Ok(blocks)
}

// === impl PoolSpec ===

impl PoolSpec {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.blocks.iter().any(|b| b.contains(addr))
    }

    /// Iterates over every allocatable address, block by block, in ascending
    /// order within each block.
    pub fn hosts(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.blocks.iter().flat_map(Block::hosts)
    }
}

// === impl Kind ===

impl Kind {
    pub fn key(&self, scope: &Scope) -> String {
        let prefix = match self {
            Self::Cidr => CIDR_PREFIX,
            Self::Range => RANGE_PREFIX,
        };
        match scope {
            Scope::Namespace(ns) => format!("{prefix}-{ns}"),
            Scope::Global => format!("{prefix}-{GLOBAL}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cidr => CIDR_PREFIX,
            Self::Range => RANGE_PREFIX,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Block ===

impl Block {
    fn parse_cidr(s: &str) -> Result<Self, String> {
        let net = s
            .parse::<IpNet>()
            .map_err(|e| format!("{s:?} is not a CIDR: {e}"))?;
        Ok(Self::Net(net.trunc()))
    }

    fn parse_range(s: &str) -> Result<Self, String> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("{s:?} is not a <start>-<end> range"))?;
        let start = start
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| format!("{start:?} is not an address: {e}"))?;
        let end = end
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| format!("{end:?} is not an address: {e}"))?;
        if start.is_ipv4() != end.is_ipv4() {
            return Err(format!("{s:?} mixes address families"));
        }
        if start > end {
            return Err(format!("{s:?} must be increasing"));
        }
        Ok(Self::Range { start, end })
    }

    /// IPv4 networks exclude their network and broadcast addresses (unless the
    /// prefix is /31 or /32). IPv6 networks and explicit ranges include every
    /// address.
    pub fn hosts(&self) -> IpAddrRange {
        match *self {
            Self::Net(net) => net.hosts(),
            Self::Range {
                start: IpAddr::V4(start),
                end: IpAddr::V4(end),
            } => IpAddrRange::V4(Ipv4AddrRange::new(start, end)),
            Self::Range {
                start: IpAddr::V6(start),
                end: IpAddr::V6(end),
            } => IpAddrRange::V6(Ipv6AddrRange::new(start, end)),
            // Mixed families are rejected when parsing.
            Self::Range { .. } => IpAddrRange::V4(Ipv4AddrRange::new(
                std::net::Ipv4Addr::BROADCAST,
                std::net::Ipv4Addr::UNSPECIFIED,
            )),
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match self {
            Self::Net(IpNet::V4(net)) => match addr {
                IpAddr::V4(a) if net.prefix_len() < 31 => {
                    net.contains(a) && *a != net.network() && *a != net.broadcast()
                }
                IpAddr::V4(a) => net.contains(a),
                IpAddr::V6(_) => false,
            },
            Self::Net(net) => net.contains(addr),
            Self::Range { start, end } => start <= addr && addr <= end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn config(data: BTreeMap<&'static str, &'static str>) -> PoolConfig {
        PoolConfig::from_iter(data)
    }

    #[rstest]
    #[case::namespaced_cidr_over_global(
        btreemap!{"cidr-default" => "10.0.0.0/29", "cidr-global" => "10.1.0.0/29"},
        "cidr-default",
    )]
    #[case::global_cidr_over_namespaced_range(
        btreemap!{"cidr-global" => "10.1.0.0/29", "range-default" => "10.2.0.1-10.2.0.9"},
        "cidr-global",
    )]
    #[case::cidr_over_range_same_scope(
        btreemap!{"cidr-default" => "10.0.0.0/29", "range-default" => "10.2.0.1-10.2.0.9"},
        "cidr-default",
    )]
    #[case::namespaced_range_over_global(
        btreemap!{"range-default" => "10.2.0.1-10.2.0.9", "range-global" => "10.3.0.1-10.3.0.9"},
        "range-default",
    )]
    #[case::global_range(
        btreemap!{"range-global" => "10.3.0.1-10.3.0.9", "cidr-other" => "10.0.0.0/29"},
        "range-global",
    )]
    fn precedence(#[case] data: BTreeMap<&'static str, &'static str>, #[case] expected: &str) {
        let pool = config(data).resolve("default").expect("pool must resolve");
        assert_eq!(pool.key, expected);
    }

    #[test]
    fn not_configured() {
        let cfg = config(btreemap! {"cidr-bar" => "10.0.0.0/29", "range-bar" => "10.0.0.1-10.0.0.2"});
        assert_eq!(
            cfg.resolve("foo"),
            Err(Error::NotConfigured {
                namespace: "foo".to_string()
            })
        );
        assert_eq!(
            PoolConfig::default().resolve("foo"),
            Err(Error::NotConfigured {
                namespace: "foo".to_string()
            })
        );
    }

    #[test]
    fn scope_and_kind() {
        let cfg = config(btreemap! {"range-global" => "192.168.0.10-192.168.0.20"});
        let pool = cfg.resolve("foo").unwrap();
        assert_eq!(pool.kind, Kind::Range);
        assert_eq!(pool.scope, Scope::Global);

        let cfg = config(btreemap! {"cidr-foo" => "192.168.0.0/24"});
        let pool = cfg.resolve("foo").unwrap();
        assert_eq!(pool.kind, Kind::Cidr);
        assert_eq!(pool.scope, Scope::Namespace("foo".to_string()));
    }

    #[test]
    fn invalid_cidr_does_not_fall_through() {
        let cfg = config(btreemap! {"cidr-foo" => "not-a-cidr", "cidr-global" => "10.0.0.0/24"});
        assert!(matches!(
            cfg.resolve("foo"),
            Err(Error::InvalidPool { key, .. }) if key == "cidr-foo"
        ));
    }

    #[rstest]
    #[case("10.0.0.9-10.0.0.1")]
    #[case("10.0.0.1-fd00::1")]
    #[case("10.0.0.1")]
    #[case(" , ")]
    fn invalid_ranges(#[case] value: &'static str) {
        let cfg = config(btreemap! {"range-global" => value});
        assert!(matches!(cfg.resolve("foo"), Err(Error::InvalidPool { .. })));
    }

    #[test]
    fn cidr_hosts_skip_network_and_broadcast() {
        let cfg = config(btreemap! {"cidr-default" => "10.0.0.0/29"});
        let pool = cfg.resolve("default").unwrap();
        let hosts = pool.hosts().map(|a| a.to_string()).collect::<Vec<_>>();
        assert_eq!(
            hosts,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"]
        );
        assert!(!pool.contains(&"10.0.0.0".parse().unwrap()));
        assert!(!pool.contains(&"10.0.0.7".parse().unwrap()));
        assert!(pool.contains(&"10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn multiple_blocks_in_listed_order() {
        let cfg = config(btreemap! {
            "range-default" => "10.0.1.5-10.0.1.6, 10.0.0.1-10.0.0.1",
        });
        let pool = cfg.resolve("default").unwrap();
        let hosts = pool.hosts().map(|a| a.to_string()).collect::<Vec<_>>();
        assert_eq!(hosts, vec!["10.0.1.5", "10.0.1.6", "10.0.0.1"]);
    }

    #[rstest]
    #[case("10.0.0.5/30", &["10.0.0.5", "10.0.0.6"])]
    #[case("10.0.0.5/29", &["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"])]
    fn host_bits_are_truncated(#[case] cidr: &'static str, #[case] expected: &[&str]) {
        let cfg = config(btreemap! {"cidr-global" => cidr});
        let pool = cfg.resolve("default").unwrap();
        let hosts = pool.hosts().map(|a| a.to_string()).collect::<Vec<_>>();
        assert_eq!(hosts, expected);
    }
}
