use crate::Error;
use gateway_controller_core::Kind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct DriverMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
    reconcile_errors: Family<ErrorLabels, Counter>,
    allocations: Family<PoolLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    kind: String,
    error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PoolLabels {
    pool_kind: String,
}

impl DriverMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of reconciliations by resource kind",
            reconciles.clone(),
        );

        let reconcile_errors = Family::default();
        prom.register(
            "reconcile_errors",
            "Count of failed reconciliations by resource kind and error class",
            reconcile_errors.clone(),
        );

        let allocations = Family::default();
        prom.register(
            "allocations",
            "Count of addresses allocated by pool kind",
            allocations.clone(),
        );

        Self {
            reconciles,
            reconcile_errors,
            allocations,
        }
    }

    pub(crate) fn record<T>(&self, kind: &str, result: &Result<T, Error>) {
        self.reconciles
            .get_or_create(&ReconcileLabels {
                kind: kind.to_string(),
            })
            .inc();
        if let Err(error) = result {
            self.reconcile_errors
                .get_or_create(&ErrorLabels {
                    kind: kind.to_string(),
                    error: error.class().to_string(),
                })
                .inc();
        }
    }

    pub(crate) fn allocated(&self, pool_kind: Kind) {
        self.allocations
            .get_or_create(&PoolLabels {
                pool_kind: pool_kind.to_string(),
            })
            .inc();
    }
}
