//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library users
//! who never export metrics pay nothing beyond a `OnceLock` lookup.

use super::prometheus::{
    ACTIVE_CONFIGURATIONS, ACTIVE_WORKERS, BACKLOG_DEPTH, JOBS_CREATED, JOBS_RUNNING,
    REPLICATIONS_TOTAL, REPLICATION_DURATION, SCHEDULER_FAULTS,
};

/// Metrics collector for recording scheduler operational metrics.
///
/// # Example
///
/// ```ignore
/// use replication_forge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_replication("succeeded", 0.25);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished replication.
    ///
    /// # Arguments
    ///
    /// * `status` - Run status label ("succeeded", "failed", "cancelled")
    /// * `duration_secs` - Run duration in seconds
    pub fn record_replication(&self, status: &str, duration_secs: f64) {
        if let Some(total) = REPLICATIONS_TOTAL.get() {
            total.with_label_values(&[status]).inc();
        }

        if let Some(duration) = REPLICATION_DURATION.get() {
            duration.with_label_values(&[status]).observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded replication metric"
        );
    }

    /// A worker started running a replication.
    pub fn replication_started(&self) {
        if let Some(running) = JOBS_RUNNING.get() {
            running.inc();
        }
    }

    /// A worker finished running a replication.
    pub fn replication_finished(&self) {
        if let Some(running) = JOBS_RUNNING.get() {
            running.dec();
        }
    }

    /// Record `count` newly created jobs.
    pub fn record_jobs_created(&self, count: usize) {
        if let Some(created) = JOBS_CREATED.get() {
            created.inc_by(count as f64);
        }
    }

    /// Update the ledger gauges.
    pub fn set_ledger_size(&self, active_configurations: usize, backlog: usize) {
        if let Some(active) = ACTIVE_CONFIGURATIONS.get() {
            active.set(active_configurations as f64);
        }
        if let Some(depth) = BACKLOG_DEPTH.get() {
            depth.set(backlog as f64);
        }
    }

    /// Set the number of workers in the pool.
    pub fn set_active_workers(&self, count: usize) {
        if let Some(workers) = ACTIVE_WORKERS.get() {
            workers.set(count as f64);
        }
    }

    /// Record a fault reported to the error sink.
    pub fn record_fault(&self, kind: &str) {
        if let Some(faults) = SCHEDULER_FAULTS.get() {
            faults.with_label_values(&[kind]).inc();
        }
        tracing::trace!(kind = kind, "Recorded scheduler fault metric");
    }
}
