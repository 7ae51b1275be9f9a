//! Error types for replication scheduling.
//!
//! Defines the crate-level error returned by the public `Scheduler` API and
//! reported to the global error sink:
//! - Submission and registration failures
//! - Setup faults raised while creating jobs for a configuration
//! - Bookkeeping faults detected by the completion pipeline
//! - Worker pool and configuration errors

use thiserror::Error;

use crate::scheduler::config::ConfigError;
use crate::scheduler::configuration::ConfigurationId;
use crate::scheduler::job::JobId;
use crate::scheduler::worker_pool::PoolError;

/// Errors that can occur while scheduling replications.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Scheduler is stopping; no new jobs are accepted")]
    Stopped,

    #[error("Task configuration '{0}' is already registered")]
    AlreadyRegistered(ConfigurationId),

    #[error("no replications could be scheduled for task configuration '{0}'")]
    NoReplications(ConfigurationId),

    #[error("Failed to set up job for task configuration '{configuration}': {message}")]
    Setup {
        configuration: ConfigurationId,
        message: String,
    },

    #[error("Bookkeeping fault for job {job} of task configuration '{configuration}': {message}")]
    Bookkeeping {
        configuration: ConfigurationId,
        job: JobId,
        message: String,
    },

    #[error("Completion pipeline is no longer running")]
    PipelineClosed,

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

impl SchedulerError {
    /// Returns the configuration the error relates to, if any.
    pub fn configuration(&self) -> Option<&ConfigurationId> {
        match self {
            SchedulerError::AlreadyRegistered(id) | SchedulerError::NoReplications(id) => Some(id),
            SchedulerError::Setup { configuration, .. }
            | SchedulerError::Bookkeeping { configuration, .. } => Some(configuration),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_replications_message() {
        let err = SchedulerError::NoReplications(ConfigurationId::new("sir-model"));
        let msg = err.to_string();
        assert!(msg.contains("no replications could be scheduled"));
        assert!(msg.contains("sir-model"));
    }

    #[test]
    fn test_configuration_accessor() {
        let err = SchedulerError::Setup {
            configuration: ConfigurationId::new("predator-prey"),
            message: "model file missing".to_string(),
        };
        assert_eq!(err.configuration().map(|c| c.as_str()), Some("predator-prey"));
        assert!(SchedulerError::Stopped.configuration().is_none());
    }
}
