//! Sync metrics tracking
//!
//! Thread-safe counters for one sync process, logged as a summary at the end
//! of each cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    decisions_started: AtomicUsize,
    decisions_succeeded: AtomicUsize,
    decisions_failed: AtomicUsize,
    attempts: AtomicUsize,
    retries: AtomicUsize,
    rows_loaded: AtomicU64,
    rows_deleted: AtomicU64,
    rows_inserted: AtomicU64,
    maintenance_runs: AtomicUsize,
    maintenance_failures: AtomicUsize,
    total_swap_ms: AtomicU64,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_decision_start(&self) {
        self.inner.decisions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self, attempt: u32) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.inner.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_decision_success(
        &self,
        rows_loaded: u64,
        rows_deleted: u64,
        rows_inserted: u64,
        duration: Duration,
    ) {
        self.inner
            .decisions_succeeded
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .rows_loaded
            .fetch_add(rows_loaded, Ordering::Relaxed);
        self.inner
            .rows_deleted
            .fetch_add(rows_deleted, Ordering::Relaxed);
        self.inner
            .rows_inserted
            .fetch_add(rows_inserted, Ordering::Relaxed);
        self.inner
            .total_swap_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_decision_failure(&self) {
        self.inner.decisions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_maintenance(&self, failures: usize) {
        self.inner.maintenance_runs.fetch_add(1, Ordering::Relaxed);
        self.inner
            .maintenance_failures
            .fetch_add(failures, Ordering::Relaxed);
    }

    pub fn decisions_succeeded(&self) -> usize {
        self.inner.decisions_succeeded.load(Ordering::Relaxed)
    }

    pub fn decisions_failed(&self) -> usize {
        self.inner.decisions_failed.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    pub fn maintenance_runs(&self) -> usize {
        self.inner.maintenance_runs.load(Ordering::Relaxed)
    }

    /// Average duration of a successful swap
    pub fn avg_swap_ms(&self) -> f64 {
        let total_ms = self.inner.total_swap_ms.load(Ordering::Relaxed) as f64;
        let swaps = self.decisions_succeeded() as f64;

        if swaps > 0.0 { total_ms / swaps } else { 0.0 }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            decisions_started: self.inner.decisions_started.load(Ordering::Relaxed),
            decisions_succeeded: self.decisions_succeeded(),
            decisions_failed: self.decisions_failed(),
            attempts: self.attempts(),
            retries: self.inner.retries.load(Ordering::Relaxed),
            rows_loaded: self.inner.rows_loaded.load(Ordering::Relaxed),
            rows_deleted: self.inner.rows_deleted.load(Ordering::Relaxed),
            rows_inserted: self.inner.rows_inserted.load(Ordering::Relaxed),
            maintenance_runs: self.maintenance_runs(),
            maintenance_failures: self.inner.maintenance_failures.load(Ordering::Relaxed),
            avg_swap_ms: self.avg_swap_ms(),
        }
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub decisions_started: usize,
    pub decisions_succeeded: usize,
    pub decisions_failed: usize,
    pub attempts: usize,
    pub retries: usize,
    pub rows_loaded: u64,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
    pub maintenance_runs: usize,
    pub maintenance_failures: usize,
    pub avg_swap_ms: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        log::info!(
            "Sync metrics: decisions={} succeeded={} failed={} attempts={} retries={} rows loaded={} deleted={} inserted={} maintenance runs={} failures={} avg_swap={:.1}ms",
            self.decisions_started,
            self.decisions_succeeded,
            self.decisions_failed,
            self.attempts,
            self.retries,
            self.rows_loaded,
            self.rows_deleted,
            self.rows_inserted,
            self.maintenance_runs,
            self.maintenance_failures,
            self.avg_swap_ms
        );
    }
}
