use super::{ParentReference, Route, RouteRule};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Binds UDP listeners on a Gateway to backend Services.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1alpha2",
    kind = "UDPRoute",
    plural = "udproutes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UDPRouteSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_refs: Option<Vec<ParentReference>>,

    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

impl Route for UDPRoute {
    const OWNER_ANNOTATION: &'static str = "parent-udp-route";
    const PROTOCOL: &'static str = "UDP";

    fn parent_refs(&self) -> &[ParentReference] {
        self.spec.parent_refs.as_deref().unwrap_or_default()
    }

    fn rules(&self) -> &[RouteRule] {
        &self.spec.rules
    }
}
