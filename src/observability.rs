//! Prometheus counters for the aggregation pipeline, kept in a private
//! registry and rendered in text exposition format for `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus content type for text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    arrivals: IntCounterVec,
    batches: IntCounterVec,
    overflow_dropped: IntCounter,
    sweep_failures: IntCounter,
    publish_failures: IntCounter,
    duplicates_skipped: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let arrivals = IntCounterVec::new(
            Opts::new("groupgate_arrivals_total", "Arrivals by ingest outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(arrivals.clone()))?;

        let batches = IntCounterVec::new(
            Opts::new(
                "groupgate_batches_total",
                "Finalized batches by the path that won the conditional delete",
            ),
            &["path"],
        )?;
        registry.register(Box::new(batches.clone()))?;

        let overflow_dropped = IntCounter::new(
            "groupgate_overflow_dropped_total",
            "Arrivals dropped because their group was already full",
        )?;
        registry.register(Box::new(overflow_dropped.clone()))?;

        let sweep_failures = IntCounter::new(
            "groupgate_sweep_failures_total",
            "Sweeper candidates that failed to finalize or republish",
        )?;
        registry.register(Box::new(sweep_failures.clone()))?;

        let publish_failures = IntCounter::new(
            "groupgate_publish_failures_total",
            "Batches left in the outbox after exhausting publish retries",
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        let duplicates_skipped = IntCounter::new(
            "groupgate_duplicates_skipped_total",
            "Batches skipped by the idempotency gate",
        )?;
        registry.register(Box::new(duplicates_skipped.clone()))?;

        Ok(Self {
            registry,
            arrivals,
            batches,
            overflow_dropped,
            sweep_failures,
            publish_failures,
            duplicates_skipped,
        })
    }

    pub fn record_arrival(&self, outcome: &str) {
        self.arrivals.with_label_values(&[outcome]).inc();
    }

    pub fn record_batch(&self, path: &str) {
        self.batches.with_label_values(&[path]).inc();
    }

    pub fn record_overflow(&self) {
        self.overflow_dropped.inc();
    }

    pub fn record_sweep_failure(&self) {
        self.sweep_failures.inc();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.inc();
    }

    pub fn arrivals(&self, outcome: &str) -> u64 {
        self.arrivals.with_label_values(&[outcome]).get()
    }

    pub fn batches(&self, path: &str) -> u64 {
        self.batches.with_label_values(&[path]).get()
    }

    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped.get()
    }

    pub fn duplicates_skipped(&self) -> u64 {
        self.duplicates_skipped.get()
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.get()
    }

    /// Text exposition of every registered family.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_arrival("buffered");
        assert_eq!(a.arrivals("buffered"), 1);
        assert_eq!(b.arrivals("buffered"), 0);
    }

    #[test]
    fn render_includes_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_batch("sweeper");
        metrics.record_batch("sweeper");
        metrics.record_overflow();
        let text = metrics.render();
        assert!(text.contains("groupgate_batches_total{path=\"sweeper\"} 2"));
        assert!(text.contains("groupgate_overflow_dropped_total 1"));
    }
}
