//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks replication throughput and duration, running jobs, ledger size and
//! faults reported to the error sink.
//!
//! # Example
//!
//! ```ignore
//! use replication_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_replication("succeeded", 0.8);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_CONFIGURATIONS, ACTIVE_WORKERS, BACKLOG_DEPTH, JOBS_CREATED, JOBS_RUNNING, REGISTRY,
    REPLICATIONS_TOTAL, REPLICATION_DURATION, SCHEDULER_FAULTS,
};
