//! Metrics collection for observability
//!
//! Each [`Metrics`] owns its own Prometheus registry, so several ledgers
//! (and tests) can live in one process.
//!
//! # Metrics
//!
//! - `wallet_operations_total{operation,outcome}` - Operations by outcome
//! - `wallet_operation_duration_seconds{operation}` - Operation latency
//! - `wallet_cas_retries_total` - Conflicting unit-of-work attempts
//! - `wallet_price_lookup_failures_total` - Catalog failures and timeouts
//! - `wallet_journal_entries_total{entry_type}` - Journal entries committed

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Operations by operation and outcome
    pub operations_total: IntCounterVec,

    /// Operation latency histogram
    pub operation_duration: HistogramVec,

    /// Conflicting attempts
    pub cas_retries: IntCounter,

    /// Price lookup failures
    pub price_lookup_failures: IntCounter,

    /// Journal entries committed by type
    pub journal_entries: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new("wallet_operations_total", "Ledger operations by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "wallet_operation_duration_seconds",
                "Histogram of operation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let cas_retries = IntCounter::new(
            "wallet_cas_retries_total",
            "Unit-of-work attempts lost to a concurrent writer",
        )?;
        registry.register(Box::new(cas_retries.clone()))?;

        let price_lookup_failures = IntCounter::new(
            "wallet_price_lookup_failures_total",
            "Currency catalog failures and timeouts",
        )?;
        registry.register(Box::new(price_lookup_failures.clone()))?;

        let journal_entries = IntCounterVec::new(
            Opts::new("wallet_journal_entries_total", "Journal entries committed"),
            &["entry_type"],
        )?;
        registry.register(Box::new(journal_entries.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            cas_retries,
            price_lookup_failures,
            journal_entries,
            registry,
        })
    }

    /// Record a finished operation
    pub fn record_operation(&self, operation: &str, outcome: &str, duration_seconds: f64) {
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a conflicting attempt
    pub fn record_cas_retry(&self) {
        self.cas_retries.inc();
    }

    /// Record a failed or timed out price lookup
    pub fn record_price_failure(&self) {
        self.price_lookup_failures.inc();
    }

    /// Record a committed journal entry
    pub fn record_entry(&self, entry_type: &str) {
        self.journal_entries.with_label_values(&[entry_type]).inc();
    }

    /// Count of operations with the given labels
    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations_total
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
