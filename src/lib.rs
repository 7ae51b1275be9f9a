//! replication_forge: concurrent replication scheduler for simulation experiments.
//!
//! This library runs repeated, independent replications of simulation task
//! configurations on a bounded worker pool, consulting a stopping criterion
//! after each round to decide whether more replications are needed.

pub mod cli;
pub mod criteria;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use error::SchedulerError;
pub use scheduler::{
    CancelOutcome, ConfigurationId, Controller, ReplicationContext, ReplicationCriterion,
    RunResult, Scheduler, SchedulerConfig, Simulation, SubmitOutcome, TaskConfiguration,
};
