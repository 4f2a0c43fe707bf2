use std::{collections::BTreeMap, fmt};

/// Selects the objects that belong to an implementation's address accounting
/// domain.
pub const IMPLEMENTATION: &str = "implementation";

/// Records the address allocated to a Gateway or Endpoint.
pub const IPAM_ADDRESS: &str = "ipam-address";

/// Stamps the controller's identity onto every Endpoint it owns.
pub const CONTROLLER_ANNOTATION: &str = "gateway-api-controller";

/// Records the namespace of the route that owns an Endpoint. Endpoints for
/// cross-namespace backends live outside the route's namespace.
pub const ROUTE_NAMESPACE_ANNOTATION: &str = "gateway-api-route-namespace";

pub type Map = BTreeMap<String, String>;

/// An equality-based label selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    match_labels: Map,
}

// === impl Selector ===

impl Selector {
    pub fn from_map(match_labels: Map) -> Self {
        Self { match_labels }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn matches(&self, labels: &Map) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Formats the selector the way the API server expects it in a list request.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.match_labels {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
