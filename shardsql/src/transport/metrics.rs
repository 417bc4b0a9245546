use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters fed by the coordinator.
#[derive(Default, Debug)]
pub struct ReducerMetrics {
    queries: AtomicU64,
    failed_queries: AtomicU64,
    query_retries: AtomicU64,
    pages_received: AtomicU64,
    updates: AtomicU64,
    failed_updates: AtomicU64,
}

impl ReducerMetrics {
    pub fn new() -> ReducerMetrics {
        ReducerMetrics::default()
    }

    pub(crate) fn inc_queries(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failed_queries(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_query_retries(&self) {
        self.query_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_pages_received(&self) {
        self.pages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_updates(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failed_updates(&self) {
        self.failed_updates.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-only snapshot handle over the coordinator counters.
pub struct MetricsView {
    metrics: Arc<ReducerMetrics>,
}

impl MetricsView {
    pub(crate) fn new(metrics: Arc<ReducerMetrics>) -> MetricsView {
        MetricsView { metrics }
    }

    pub fn queries(&self) -> u64 {
        self.metrics.queries.load(Ordering::Relaxed)
    }

    pub fn failed_queries(&self) -> u64 {
        self.metrics.failed_queries.load(Ordering::Relaxed)
    }

    pub fn query_retries(&self) -> u64 {
        self.metrics.query_retries.load(Ordering::Relaxed)
    }

    pub fn pages_received(&self) -> u64 {
        self.metrics.pages_received.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.metrics.updates.load(Ordering::Relaxed)
    }

    pub fn failed_updates(&self) -> u64 {
        self.metrics.failed_updates.load(Ordering::Relaxed)
    }
}
