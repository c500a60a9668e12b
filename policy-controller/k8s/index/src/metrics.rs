use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts the cluster events handled by the controller.
#[derive(Clone, Debug, Default)]
pub struct EventMetrics {
    handled: Family<EventLabels, Counter>,
    resets: Family<ResetLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    kind: String,
    op: Op,
    result: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResetLabels {
    kind: String,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum Op {
    apply,
    delete,
    sync,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
enum Outcome {
    ok,
    error,
}

// === impl EventMetrics ===

impl EventMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let handled = Family::default();
        prom.register(
            "events",
            "Count of cluster events handled, by kind, operation, and result",
            handled.clone(),
        );

        let resets = Family::default();
        prom.register(
            "watch_resets",
            "Count of completed initial lists, by kind",
            resets.clone(),
        );

        Self { handled, resets }
    }

    pub fn record<T, E>(&self, kind: &str, op: Op, result: &Result<T, E>) {
        let result = if result.is_ok() {
            Outcome::ok
        } else {
            Outcome::error
        };
        self.handled
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
                op,
                result,
            })
            .inc();
    }

    pub fn reset(&self, kind: &str) {
        self.resets
            .get_or_create(&ResetLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    fn handled(&self, kind: &str, op: Op, ok: bool) -> u64 {
        let result = if ok { Outcome::ok } else { Outcome::error };
        self.handled
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
                op,
                result,
            })
            .get()
    }
}
