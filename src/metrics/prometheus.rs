//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by replication_forge and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all replication_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of replications reported by workers, labeled by status.
pub static REPLICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Replication run duration in seconds, labeled by status.
pub static REPLICATION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of replications currently running on a worker.
pub static JOBS_RUNNING: OnceLock<Gauge> = OnceLock::new();

/// Total jobs created by the scheduler.
pub static JOBS_CREATED: OnceLock<Counter> = OnceLock::new();

/// Number of configurations registered in the ledger.
pub static ACTIVE_CONFIGURATIONS: OnceLock<Gauge> = OnceLock::new();

/// Number of submissions waiting in the backlog.
pub static BACKLOG_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of workers in the pool.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Faults reported to the error sink, labeled by kind (setup, bookkeeping).
pub static SCHEDULER_FAULTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording through `MetricsCollector` before this is
/// a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Replication metrics
    let replications_total = CounterVec::new(
        Opts::new(
            "replication_forge_replications_total",
            "Total number of replications reported by workers",
        ),
        &["status"],
    )?;

    let replication_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "replication_forge_replication_duration_seconds",
            "Replication run duration in seconds",
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["status"],
    )?;

    let jobs_running = Gauge::new(
        "replication_forge_jobs_running",
        "Number of replications currently running",
    )?;

    let jobs_created = Counter::new(
        "replication_forge_jobs_created_total",
        "Total jobs created by the scheduler",
    )?;

    // Ledger metrics
    let active_configurations = Gauge::new(
        "replication_forge_active_configurations",
        "Number of task configurations registered in the ledger",
    )?;

    let backlog_depth = Gauge::new(
        "replication_forge_backlog_depth",
        "Number of submissions waiting for a free configuration slot",
    )?;

    let active_workers = Gauge::new("replication_forge_active_workers", "Number of workers")?;

    let scheduler_faults = IntCounterVec::new(
        Opts::new(
            "replication_forge_faults_total",
            "Faults reported to the error sink",
        ),
        &["kind"],
    )?;

    registry.register(Box::new(replications_total.clone()))?;
    registry.register(Box::new(replication_duration.clone()))?;
    registry.register(Box::new(jobs_running.clone()))?;
    registry.register(Box::new(jobs_created.clone()))?;
    registry.register(Box::new(active_configurations.clone()))?;
    registry.register(Box::new(backlog_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(scheduler_faults.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = REPLICATIONS_TOTAL.set(replications_total);
    let _ = REPLICATION_DURATION.set(replication_duration);
    let _ = JOBS_RUNNING.set(jobs_running);
    let _ = JOBS_CREATED.set(jobs_created);
    let _ = ACTIVE_CONFIGURATIONS.set(active_configurations);
    let _ = BACKLOG_DEPTH.set(backlog_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = SCHEDULER_FAULTS.set(scheduler_faults);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
