//! Read-only bindings for the slice of the Gateway API this controller
//! consumes. Fields the controller does not read are not modeled; objects of
//! these kinds are never written back wholesale.

pub mod gateway_classes;
pub mod gateways;
pub mod refs;
pub mod tcp_routes;
pub mod udp_routes;

pub use self::{
    gateway_classes::{GatewayClass, GatewayClassSpec},
    gateways::{Gateway, GatewaySpec, Listener},
    refs::{BackendReference, ParentReference, RouteRule},
    tcp_routes::{TCPRoute, TCPRouteSpec},
    udp_routes::{UDPRoute, UDPRouteSpec},
};

pub const GROUP: &str = "gateway.networking.k8s.io";

/// A route kind that binds Gateway listeners to backends.
pub trait Route:
    kube::Resource<DynamicType = (), Scope = crate::NamespaceResourceScope>
{
    /// The annotation that records the owning route's name on Endpoints.
    const OWNER_ANNOTATION: &'static str;

    /// The protocol of the ports synthesized for this route kind.
    const PROTOCOL: &'static str;

    fn parent_refs(&self) -> &[ParentReference];

    fn rules(&self) -> &[RouteRule];

    fn backend_refs(&self) -> impl Iterator<Item = &BackendReference> + Send {
        self.rules().iter().flat_map(|rule| rule.backend_refs.iter())
    }
}

/// Checks whether a reference's group and kind name the given resource type.
/// An unset group is the core group.
pub(crate) fn targets_kind<T>(group: Option<&str>, kind: &str) -> bool
where
    T: kube::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();

    let mut t_group = &*T::group(&dt);
    if t_group.is_empty() {
        t_group = "core";
    }

    let group = match group {
        None | Some("") => "core",
        Some(g) => g,
    };

    group.eq_ignore_ascii_case(t_group) && kind.eq_ignore_ascii_case(&T::kind(&dt))
}
