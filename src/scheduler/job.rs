//! Job definitions for the replication scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: one in-flight execution of one replication of a configuration
//! - `JobState`: lifecycle CREATED → SUBMITTED → RUNNING → {COMPLETED, CANCELLED}
//! - `CancellationFlag`: cooperative, advisory cancellation shared with the run
//! - `RunResult`: outcome of one replication, handed to the controller

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::configuration::{ConfigurationId, TaskConfiguration};
use super::controller::Controller;

/// Unique identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a new random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    /// Job exists but has not been handed to the worker pool.
    Created = 0,
    /// Job is queued in the worker pool.
    Submitted = 1,
    /// A worker is executing the replication.
    Running = 2,
    /// The replication ran to completion (successfully or not).
    Completed = 3,
    /// The job was cancelled, before or during its run.
    Cancelled = 4,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Created,
            1 => JobState::Submitted,
            2 => JobState::Running,
            3 => JobState::Completed,
            _ => JobState::Cancelled,
        }
    }

    /// Returns whether the state is COMPLETED or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => write!(f, "created"),
            JobState::Submitted => write!(f, "submitted"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Advisory cancellation flag shared between a job and its running replication.
///
/// Cancellation is cooperative: the simulation decides how often it polls.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One in-flight execution of one replication of a task configuration.
///
/// Jobs are shared (`Arc<Job>`) between the ledger's active set, the worker
/// pool queue and the controller. State changes are atomic so that exactly
/// one terminal state is ever reached.
pub struct Job {
    id: JobId,
    replication: usize,
    configuration: TaskConfiguration,
    controller: Arc<dyn Controller>,
    state: AtomicU8,
    cancellation: CancellationFlag,
    created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a job in state CREATED.
    pub fn new(
        configuration: TaskConfiguration,
        replication: usize,
        controller: Arc<dyn Controller>,
    ) -> Self {
        Self {
            id: JobId::new(),
            replication,
            configuration,
            controller,
            state: AtomicU8::new(JobState::Created as u8),
            cancellation: CancellationFlag::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Zero-based replication index within the configuration.
    pub fn replication(&self) -> usize {
        self.replication
    }

    pub fn configuration(&self) -> &TaskConfiguration {
        &self.configuration
    }

    pub fn configuration_id(&self) -> &ConfigurationId {
        self.configuration.id()
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cancellation_flag(&self) -> &CancellationFlag {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Requests cancellation. Safe to call from any state.
    ///
    /// A job that has not started yet is skipped by the worker that dequeues
    /// it. A running job only sees the flag; it still completes and reports
    /// through the completion pipeline.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// CREATED → SUBMITTED. Returns false if the job was not in CREATED.
    pub fn mark_submitted(&self) -> bool {
        self.transition(JobState::Created, JobState::Submitted)
    }

    /// CREATED/SUBMITTED → RUNNING. Returns false if the job was cancelled
    /// or has already left the queue.
    pub fn try_start(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.transition(JobState::Submitted, JobState::Running)
            || self.transition(JobState::Created, JobState::Running)
    }

    /// RUNNING → COMPLETED, or CANCELLED if cancellation was requested
    /// while the replication ran. Returns the resulting state.
    pub fn finish(&self) -> JobState {
        let target = if self.is_cancelled() {
            JobState::Cancelled
        } else {
            JobState::Completed
        };
        self.transition(JobState::Running, target);
        self.state()
    }

    /// Moves any non-terminal job straight to CANCELLED.
    ///
    /// Used for jobs skipped at dequeue and for forced cancellation during
    /// shutdown. Returns false if the job already reached a terminal state.
    pub fn force_cancel(&self) -> bool {
        self.cancellation.cancel();
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if JobState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                JobState::Cancelled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("configuration", self.configuration.id())
            .field("replication", &self.replication)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Outcome category of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The replication produced a result.
    Succeeded,
    /// Setup or execution failed.
    Failed,
    /// The replication was cancelled or its result discarded.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Opaque id of this completion, used by persistent storage.
    pub completion_id: Uuid,
    /// Configuration the replication belongs to.
    pub configuration_id: ConfigurationId,
    /// Job that produced the result. `None` for setup faults.
    pub job_id: Option<JobId>,
    /// Zero-based replication index.
    pub replication: usize,
    /// Outcome category.
    pub status: RunStatus,
    /// Error message for failed or cancelled replications.
    pub error: Option<String>,
    /// Simulation output.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Worker that executed the replication.
    pub worker_id: Option<String>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// When the result was produced.
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    fn base(job: &Job, status: RunStatus) -> Self {
        Self {
            completion_id: Uuid::new_v4(),
            configuration_id: job.configuration_id().clone(),
            job_id: Some(job.id()),
            replication: job.replication(),
            status,
            error: None,
            payload: None,
            worker_id: None,
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }

    /// Creates a successful result.
    pub fn success(
        job: &Job,
        worker_id: impl Into<String>,
        payload: Option<serde_json::Value>,
        duration_ms: u64,
    ) -> Self {
        Self {
            payload,
            worker_id: Some(worker_id.into()),
            duration_ms,
            ..Self::base(job, RunStatus::Succeeded)
        }
    }

    /// Creates a failed result for an execution fault.
    pub fn failure(
        job: &Job,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            error: Some(error.into()),
            worker_id: Some(worker_id.into()),
            duration_ms,
            ..Self::base(job, RunStatus::Failed)
        }
    }

    /// Creates a result for a job that was cancelled before it ran.
    pub fn cancelled(job: &Job, worker_id: impl Into<String>) -> Self {
        Self {
            error: Some("Job was cancelled".to_string()),
            worker_id: Some(worker_id.into()),
            ..Self::base(job, RunStatus::Cancelled)
        }
    }

    /// Creates a result for a job the worker pool refused to accept.
    pub fn withdrawn(job: &Job, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(job, RunStatus::Cancelled)
        }
    }

    /// Creates a failed result for a bookkeeping fault detected by the pipeline.
    pub fn orphaned(job: &Job, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(job, RunStatus::Failed)
        }
    }

    /// Creates a failed result for a configuration that could not start
    /// (or continue) because no job could be set up.
    pub fn setup_failure(configuration_id: &ConfigurationId, error: impl Into<String>) -> Self {
        Self {
            completion_id: Uuid::new_v4(),
            configuration_id: configuration_id.clone(),
            job_id: None,
            replication: 0,
            status: RunStatus::Failed,
            error: Some(error.into()),
            payload: None,
            worker_id: None,
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }

    /// Converts a result that must not be recorded into a discarded one.
    pub fn discard(mut self, reason: &str) -> Self {
        self.status = RunStatus::Cancelled;
        self.payload = None;
        if self.error.is_none() {
            self.error = Some(format!("Result discarded: {}", reason));
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}
