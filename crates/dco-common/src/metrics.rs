//! Reconciler instruments
//!
//! All instruments hang off the global meter and are created on first use,
//! so recording is free until [`crate::telemetry`] installs an exporting
//! provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;

struct Instruments {
    /// `controller`, `result`
    reconcile_duration: Histogram<f64>,
    /// `controller`
    reconcile_errors: Counter<u64>,
    /// `controller`, `component`, `phase`
    component_errors: Counter<u64>,
    /// `kind`
    patch_updates: Counter<u64>,
}

static INSTRUMENTS: Lazy<Instruments> = Lazy::new(|| {
    let meter = global::meter("dco");
    Instruments {
        reconcile_duration: meter
            .f64_histogram("dco_reconcile_duration_seconds")
            .with_description("Wall time of one reconcile pass")
            .with_unit("s")
            .build(),
        reconcile_errors: meter
            .u64_counter("dco_reconcile_errors_total")
            .with_description("Reconcile passes that returned an error")
            .build(),
        component_errors: meter
            .u64_counter("dco_component_errors_total")
            .with_description("Component steps that returned an error")
            .build(),
        patch_updates: meter
            .u64_counter("dco_patch_updates_total")
            .with_description("Updates sent for controlled objects that drifted")
            .build(),
    }
});

/// `result` label of a reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Success,
    Error,
}

impl ReconcileOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Record one reconcile pass and count it as an error when it failed
pub fn record_reconcile(controller: &str, outcome: ReconcileOutcome, seconds: f64) {
    let controller = KeyValue::new("controller", controller.to_string());
    INSTRUMENTS.reconcile_duration.record(
        seconds,
        &[controller.clone(), KeyValue::new("result", outcome.label())],
    );
    if outcome == ReconcileOutcome::Error {
        INSTRUMENTS.reconcile_errors.add(1, &[controller]);
    }
}

/// `phase` is `reconcile` or `finalize`
pub fn record_component_error(controller: &str, component: &str, phase: &'static str) {
    INSTRUMENTS.component_errors.add(
        1,
        &[
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("component", component.to_string()),
            KeyValue::new("phase", phase),
        ],
    );
}

/// Count an update sent for a drifted object of `kind`
pub fn record_patch_update(kind: &str) {
    INSTRUMENTS
        .patch_updates
        .add(1, &[KeyValue::new("kind", kind.to_string())]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_provider_is_a_noop() {
        record_reconcile("daskcluster", ReconcileOutcome::Error, 0.25);
        record_reconcile("daskcluster", ReconcileOutcome::Success, 0.01);
        record_component_error("daskcluster", "service-worker", "reconcile");
        record_patch_update("StatefulSet");
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(ReconcileOutcome::Success.label(), "success");
        assert_eq!(ReconcileOutcome::Error.label(), "error");
    }
}
