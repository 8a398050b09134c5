//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger store.
//! Each `Storage` owns one `Metrics` with its own registry, so several stores
//! can live in one process (tests, co-located participants).
//!
//! # Metrics
//!
//! - `ledger_txn_committed_total` - Optimistic transactions committed
//! - `ledger_txn_conflicts_total` - Precondition failures that forced a retry
//! - `ledger_txn_aborted_total` - Transactions rolled back by a business error
//! - `ledger_txn_commit_duration_seconds` - Histogram of commit latencies
//! - `ledger_outbox_enqueued_total` - Outbox records written
//! - `ledger_outbox_published_total` - Outbox records marked published
//! - `ledger_outbox_claim_released_total` - Claims returned after a failed publish

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Transactions committed
    pub txn_committed: IntCounter,

    /// Transactions retried after a conflict
    pub txn_conflicts: IntCounter,

    /// Transactions aborted by the closure
    pub txn_aborted: IntCounter,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Outbox records written
    pub outbox_enqueued: IntCounter,

    /// Outbox records published
    pub outbox_published: IntCounter,

    /// Outbox claims released after a failure
    pub outbox_claim_released: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("txn_committed", &self.txn_committed.get())
            .field("txn_conflicts", &self.txn_conflicts.get())
            .field("outbox_enqueued", &self.outbox_enqueued.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let txn_committed = IntCounter::new(
            "ledger_txn_committed_total",
            "Optimistic transactions committed",
        )?;
        registry.register(Box::new(txn_committed.clone()))?;

        let txn_conflicts = IntCounter::new(
            "ledger_txn_conflicts_total",
            "Precondition failures that forced a retry",
        )?;
        registry.register(Box::new(txn_conflicts.clone()))?;

        let txn_aborted = IntCounter::new(
            "ledger_txn_aborted_total",
            "Transactions rolled back by a business error",
        )?;
        registry.register(Box::new(txn_aborted.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_txn_commit_duration_seconds",
                "Histogram of commit latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        let outbox_enqueued = IntCounter::new(
            "ledger_outbox_enqueued_total",
            "Outbox records written",
        )?;
        registry.register(Box::new(outbox_enqueued.clone()))?;

        let outbox_published = IntCounter::new(
            "ledger_outbox_published_total",
            "Outbox records marked published",
        )?;
        registry.register(Box::new(outbox_published.clone()))?;

        let outbox_claim_released = IntCounter::new(
            "ledger_outbox_claim_released_total",
            "Claims returned after a failed publish",
        )?;
        registry.register(Box::new(outbox_claim_released.clone()))?;

        Ok(Self {
            txn_committed,
            txn_conflicts,
            txn_aborted,
            commit_duration,
            outbox_enqueued,
            outbox_published,
            outbox_claim_released,
            registry,
        })
    }

    /// Record a successful commit
    pub fn record_commit(&self, duration_seconds: f64, outbox_records: usize) {
        self.txn_committed.inc();
        self.commit_duration.observe(duration_seconds);
        self.outbox_enqueued.inc_by(outbox_records as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode ledger metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
