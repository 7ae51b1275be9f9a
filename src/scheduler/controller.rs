//! External collaborators notified by the scheduler.
//!
//! - `Controller`: one per configuration, told about created jobs and
//!   reconciled replications. Called from the completion pipeline, so
//!   implementations must return quickly.
//! - `CompletionStorage`: persistent storage hook for configurations that
//!   declare it.
//! - `ErrorSink`: the global error sink for setup and bookkeeping faults.

use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use super::configuration::ConfigurationId;
use super::job::{Job, RunResult};
use crate::error::SchedulerError;

/// Receives lifecycle notifications for the configurations it submitted.
pub trait Controller: Send + Sync + 'static {
    /// A job was created and is about to be handed to the worker pool.
    fn on_job_created(&self, _job: &Arc<Job>) {}

    /// A replication was reconciled by the completion pipeline.
    ///
    /// `is_last` is true when no further replications will be reported for
    /// the configuration.
    fn on_replication_completed(&self, job: &Arc<Job>, result: &RunResult, is_last: bool);

    /// The configuration could not start, or could not create further jobs.
    fn on_setup_failed(&self, _configuration: &ConfigurationId, _result: &RunResult) {}
}

/// Controller that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopController;

impl Controller for NoopController {
    fn on_replication_completed(&self, _job: &Arc<Job>, _result: &RunResult, _is_last: bool) {}
}

/// Persistent storage collaborator.
pub trait CompletionStorage: Send + Sync + 'static {
    /// No further writes will happen for `completion_id`.
    fn on_configuration_done(&self, completion_id: &Uuid);
}

/// Global sink for faults that are not returned to a caller.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, error: &SchedulerError);
}

/// Default error sink: logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, err: &SchedulerError) {
        match err.configuration() {
            Some(configuration) => {
                error!(configuration = %configuration, error = %err, "Scheduler fault")
            }
            None => error!(error = %err, "Scheduler fault"),
        }
    }
}
