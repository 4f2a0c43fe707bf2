use crate::store::StoreError;
use gateway_controller_core::pool;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no address pool configured for namespace {namespace}")]
    NotConfigured { namespace: String },

    #[error("invalid address pool {key}: {reason}")]
    InvalidPool { key: String, reason: String },

    #[error("address pool {pool} is exhausted (namespace {namespace})")]
    PoolExhausted { namespace: String, pool: String },

    /// An optimistic write lost to a concurrent writer and could not be
    /// retried to completion within this invocation.
    #[error("concurrent modification of {resource}")]
    Conflict { resource: String },

    #[error("{kind} {name} has no namespace")]
    MissingNamespace { kind: String, name: String },

    #[error(transparent)]
    Store(StoreError),
}

impl Error {
    /// A short, stable name for the error class, used as a metric label.
    pub fn class(&self) -> &'static str {
        match self {
            Self::NotConfigured { .. } => "not_configured",
            Self::InvalidPool { .. } => "invalid_pool",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::Conflict { .. } => "conflict",
            Self::MissingNamespace { .. } => "missing_namespace",
            Self::Store(_) => "store",
        }
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(resource) | StoreError::AlreadyExists(resource) => {
                Self::Conflict { resource }
            }
            error => Self::Store(error),
        }
    }
}

impl From<pool::Error> for Error {
    fn from(error: pool::Error) -> Self {
        match error {
            pool::Error::NotConfigured { namespace } => Self::NotConfigured { namespace },
            pool::Error::InvalidPool { key, value, reason } => Self::InvalidPool {
                key,
                reason: format!("{value:?}: {reason}"),
            },
        }
    }
}
