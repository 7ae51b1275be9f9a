//! Concurrent replication scheduler.
//!
//! This module runs repeated, independent replications of simulation task
//! configurations on a bounded pool of workers:
//!
//! - **Scheduler**: public API (submit, cancel, status, stop)
//! - **WorkerPool**: N workers sharing one job queue, at most N runs at once
//! - **CompletionPipeline**: single consumer that owns the ledger and decides,
//!   after each completion, whether more replications are needed
//! - **Job**: one replication with its lifecycle and cancellation flag
//!
//! # Architecture
//!
//! ```text
//!      submit / cancel / status            completions
//!   ┌─────────────┐                  ┌──────────────────────┐
//!   │  Scheduler  │────────────────▶ │  CompletionPipeline  │
//!   │   (API)     │   FIFO channel   │  (owns the Ledger)   │
//!   └─────────────┘        ▲         └──────────┬───────────┘
//!                          │                    │ new jobs
//!                          │             ┌──────▼───────┐
//!                          │             │   Job queue  │
//!                          │             └──────┬───────┘
//!                          │     ┌──────────────┼──────────────┐
//!                          │     ▼              ▼              ▼
//!                          │ ┌─────────┐   ┌─────────┐   ┌─────────┐
//!                          └─│ Worker 1│   │ Worker 2│   │ Worker N│
//!                            └─────────┘   └─────────┘   └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use replication_forge::criteria::FixedReplications;
//! use replication_forge::scheduler::{
//!     NoopController, ReplicationContext, Scheduler, SchedulerConfig, TaskConfiguration,
//! };
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::new(SchedulerConfig::new(-1))?;
//!
//! let simulation = Arc::new(|ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
//!     Ok(Some(serde_json::json!({"replication": ctx.replication})))
//! });
//! let configuration = TaskConfiguration::new("sir-baseline", simulation, Arc::new(FixedReplications(30)));
//! scheduler.submit(configuration, Arc::new(NoopController)).await?;
//!
//! // Graceful shutdown
//! scheduler.stop().await?;
//! ```
//!
//! # Guarantees
//!
//! - **Bounded concurrency**: never more than N replications run at once
//! - **Criterion sees everything**: the stopping criterion is only consulted
//!   once every planned replication has reported
//! - **Exactly one last notification** per configuration that ran to completion
//! - **Bounded shutdown**: `stop()` force-cancels what does not finish in time

pub mod config;
pub mod configuration;
pub mod controller;
pub mod job;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod worker_pool;

pub use config::{available_parallelism, resolve_worker_count, ConfigError, SchedulerConfig};
pub use configuration::{
    ConfigurationId, ReplicationContext, ReplicationCriterion, Simulation, TaskConfiguration,
};
pub use controller::{CompletionStorage, Controller, ErrorSink, NoopController, TracingErrorSink};
pub use job::{CancellationFlag, Job, JobId, JobState, RunResult, RunStatus};
pub use ledger::ConfigurationStatus;
pub use orchestrator::{CancelOutcome, Scheduler, SchedulerBuilder, SubmitOutcome};
pub use pipeline::CompletionEnvelope;
pub use worker_pool::{PoolError, PoolStats, WorkerPool};
