use crate::ResourceId;
use std::fmt;

/// What a route reconciliation did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub created: Vec<ResourceId>,
    pub updated: Vec<ResourceId>,
    pub unchanged: Vec<ResourceId>,
    pub pruned: Vec<ResourceId>,
    pub unresolved: Vec<Unresolved>,
}

/// A reference that could not be bound. These are expected while objects are
/// being created or edited, so they are recorded and skipped rather than
/// failing the reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unresolved {
    UnsupportedParentKind {
        parent: ResourceId,
    },
    GatewayNotFound {
        gateway: ResourceId,
    },
    ForeignGatewayClass {
        gateway: ResourceId,
        class: String,
    },
    MissingSectionName {
        gateway: ResourceId,
    },
    ListenerNotFound {
        gateway: ResourceId,
        section_name: String,
    },
    UnsupportedBackendKind {
        backend: ResourceId,
    },
    MissingBackendPort {
        backend: ResourceId,
    },
    BackendNotFound {
        backend: ResourceId,
    },
    /// An object already exists where an Endpoint would be written and it is
    /// not owned by this route.
    ForeignEndpoint {
        endpoint: ResourceId,
    },
    /// Another Gateway already binds the Endpoint for this backend.
    ShadowedParent {
        endpoint: ResourceId,
        gateway: ResourceId,
    },
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedParentKind { parent } => {
                write!(f, "parent {parent} is not a Gateway")
            }
            Self::GatewayNotFound { gateway } => write!(f, "gateway {gateway} not found"),
            Self::ForeignGatewayClass { gateway, class } => {
                write!(f, "gateway {gateway} class {class} is not managed here")
            }
            Self::MissingSectionName { gateway } => {
                write!(f, "reference to gateway {gateway} names no listener")
            }
            Self::ListenerNotFound {
                gateway,
                section_name,
            } => write!(f, "gateway {gateway} has no listener {section_name}"),
            Self::UnsupportedBackendKind { backend } => {
                write!(f, "backend {backend} is not a Service")
            }
            Self::MissingBackendPort { backend } => {
                write!(f, "backend {backend} specifies no port")
            }
            Self::BackendNotFound { backend } => write!(f, "backend {backend} not found"),
            Self::ForeignEndpoint { endpoint } => {
                write!(f, "endpoint {endpoint} exists and is not owned by this route")
            }
            Self::ShadowedParent { endpoint, gateway } => {
                write!(f, "endpoint {endpoint} is already bound to another gateway than {gateway}")
            }
        }
    }
}
