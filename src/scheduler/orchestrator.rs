//! Public scheduler API and job creation.
//!
//! The `Scheduler` wires the worker pool to the completion pipeline and turns
//! every public call into a message for the pipeline, so the ledger is only
//! ever touched by one task. Job creation and the backlog also live here, as
//! an extension of the pipeline.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;

use super::config::SchedulerConfig;
use super::configuration::{ConfigurationId, TaskConfiguration};
use super::controller::{CompletionStorage, Controller, ErrorSink, TracingErrorSink};
use super::job::{Job, RunResult};
use super::ledger::{ConfigurationStatus, Ledger, PendingSubmission};
use super::pipeline::{CompletionPipeline, CompletionSender, PipelineMessage, SchedulerShared};
use super::worker_pool::{PoolError, PoolStats, WorkerPool};

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmitOutcome {
    /// The configuration was registered and its first jobs were queued.
    Started { replications: usize },
    /// The configuration was parked in the backlog at this 1-based position.
    Queued { position: usize },
}

/// What happened to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancelOutcome {
    /// No such configuration.
    NotFound,
    /// Cancellation was already requested earlier.
    AlreadyCancelling,
    /// The configuration had no active jobs and was removed immediately.
    Removed,
    /// Active jobs were signalled; their results will be discarded.
    Cancelling { jobs: usize },
    /// The configuration was still in the backlog and was dropped.
    Dequeued,
}

/// Builder for a `Scheduler` with custom collaborators.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    storage: Option<Arc<dyn CompletionStorage>>,
    error_sink: Arc<dyn ErrorSink>,
}

impl SchedulerBuilder {
    /// Sets the persistent storage collaborator.
    pub fn storage(mut self, storage: Arc<dyn CompletionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replaces the default `TracingErrorSink`.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Validates the configuration and starts the workers and the pipeline.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` for an invalid configuration (such as
    /// a worker count of zero) and `SchedulerError::NoRuntime` outside tokio.
    pub fn start(self) -> Result<Scheduler, SchedulerError> {
        self.config.validate()?;
        let num_workers = self.config.resolved_workers()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let sender = CompletionSender::new(tx);
        let shared = Arc::new(SchedulerShared::new(self.config, self.storage, self.error_sink));

        let pool = Arc::new(WorkerPool::new(num_workers, sender.clone()));
        pool.start()?;
        shared.metrics.set_active_workers(num_workers);

        let pipeline = CompletionPipeline::new(rx, Arc::clone(&pool), Arc::clone(&shared));
        let handle = runtime.spawn(pipeline.run());

        info!(
            workers = num_workers,
            max_active_configurations = ?shared.config.max_active_configurations,
            "Scheduler started"
        );

        Ok(Scheduler {
            shared,
            pool,
            sender,
            pipeline: Mutex::new(Some(handle)),
        })
    }
}

/// Schedules replications of task configurations onto a bounded worker pool.
///
/// # Example
///
/// ```rust,ignore
/// use replication_forge::criteria::FixedReplications;
/// use replication_forge::scheduler::{NoopController, Scheduler, SchedulerConfig, TaskConfiguration};
///
/// let scheduler = Scheduler::new(SchedulerConfig::new(-1))?;
/// let configuration = TaskConfiguration::new("sir", simulation, Arc::new(FixedReplications(10)));
/// scheduler.submit(configuration, Arc::new(NoopController)).await?;
/// scheduler.stop().await?;
/// ```
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    pool: Arc<WorkerPool>,
    sender: CompletionSender,
    pipeline: Mutex<Option<JoinHandle<Ledger>>>,
}

impl Scheduler {
    /// Returns a builder for a scheduler with custom collaborators.
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            storage: None,
            error_sink: Arc::new(TracingErrorSink),
        }
    }

    /// Starts a scheduler with the default collaborators.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::builder(config).start()
    }

    /// Registers a configuration and schedules its first replications.
    ///
    /// # Errors
    ///
    /// - `Stopped` once `stop()` has been called
    /// - `AlreadyRegistered` if the id is active or queued
    /// - `NoReplications` if the criterion asks for none
    /// - `Setup` if a job could not be set up
    pub async fn submit(
        &self,
        configuration: TaskConfiguration,
        controller: Arc<dyn Controller>,
    ) -> Result<SubmitOutcome, SchedulerError> {
        if self.shared.is_stopping() {
            return Err(SchedulerError::Stopped);
        }
        let (reply, rx) = oneshot::channel();
        self.request(
            PipelineMessage::Submit {
                configuration,
                controller,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Cancels one configuration. Running jobs finish but their results are
    /// discarded; queued jobs are skipped.
    pub async fn cancel_configuration(
        &self,
        id: impl Into<ConfigurationId>,
    ) -> Result<CancelOutcome, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            PipelineMessage::Cancel {
                configuration: id.into(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Cancels every configuration whose controller matches `predicate`.
    /// Returns how many were newly cancelled or dropped from the backlog.
    pub async fn cancel_all<F>(&self, predicate: F) -> Result<usize, SchedulerError>
    where
        F: Fn(&Arc<dyn Controller>) -> bool + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.request(
            PipelineMessage::CancelAll {
                filter: Box::new(predicate),
                reply,
            },
            rx,
        )
        .await
    }

    /// Snapshot of one configuration's bookkeeping. `None` if it is not
    /// registered or the scheduler has stopped.
    pub async fn status(&self, id: impl Into<ConfigurationId>) -> Option<ConfigurationStatus> {
        let (reply, rx) = oneshot::channel();
        self.request(
            PipelineMessage::Inspect {
                configuration: id.into(),
                reply,
            },
            rx,
        )
        .await
        .ok()
        .flatten()
    }

    /// Current worker pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    /// True once `stop()` has been called.
    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Stops the scheduler.
    ///
    /// Refuses new work, lets running replications finish (bounded by the
    /// configured shutdown timeout) and discards their results, stops the
    /// pipeline and force-cancels every job that never reported. Idempotent; a concurrent caller waits for the
    /// first one to finish.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut pipeline = self.pipeline.lock().await;
        let Some(handle) = pipeline.take() else {
            debug!("Scheduler already stopped");
            return Ok(());
        };

        self.shared.begin_stopping();
        info!("Stopping scheduler");

        match self.pool.shutdown(self.shared.config.shutdown_timeout).await {
            Ok(()) | Err(PoolError::NotRunning) => {}
            Err(e) => warn!(error = %e, "Worker pool did not stop cleanly"),
        }

        self.sender.send(PipelineMessage::Poison);
        let mut ledger = handle.await.map_err(|e| {
            warn!(error = %e, "Completion pipeline task failed");
            SchedulerError::PipelineClosed
        })?;

        let leftovers = ledger.drain_active_jobs();
        let mut forced = 0;
        for job in &leftovers {
            if job.force_cancel() {
                forced += 1;
            }
        }
        info!(
            unreported = leftovers.len(),
            force_cancelled = forced,
            "Scheduler stopped"
        );
        Ok(())
    }

    async fn request<T>(
        &self,
        message: PipelineMessage,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, SchedulerError> {
        if !self.sender.send(message) {
            return Err(SchedulerError::PipelineClosed);
        }
        rx.await.map_err(|_| SchedulerError::PipelineClosed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.shared.begin_stopping() {
            debug!("Scheduler dropped without stop(); signalling shutdown");
            self.pool.signal_shutdown();
            self.sender.send(PipelineMessage::Poison);
        }
    }
}

impl CompletionPipeline {
    /// Registers a submission, or parks it when the ledger is full.
    pub(super) fn handle_submit(
        &mut self,
        configuration: TaskConfiguration,
        controller: Arc<dyn Controller>,
    ) -> Result<SubmitOutcome, SchedulerError> {
        if self.shared.is_stopping() {
            return Err(SchedulerError::Stopped);
        }
        let id = configuration.id().clone();
        if self.ledger.is_known(&id) {
            return Err(SchedulerError::AlreadyRegistered(id));
        }

        if !self.has_capacity() {
            let position = self.ledger.enqueue_backlog(PendingSubmission {
                configuration,
                controller,
            });
            info!(configuration = %id, position, "Configuration queued in backlog");
            return Ok(SubmitOutcome::Queued { position });
        }

        self.start_configuration(configuration, controller)
    }

    fn has_capacity(&self) -> bool {
        self.shared
            .config
            .max_active_configurations
            .map_or(true, |max| self.ledger.len() < max)
    }

    /// Evaluates the criterion on an empty history, creates the first jobs
    /// and only then registers the configuration.
    fn start_configuration(
        &mut self,
        configuration: TaskConfiguration,
        controller: Arc<dyn Controller>,
    ) -> Result<SubmitOutcome, SchedulerError> {
        let id = configuration.id().clone();

        let wanted = configuration.allowed_replications(&[]);
        if wanted == 0 {
            let err = SchedulerError::NoReplications(id);
            self.report_setup_failure(&controller, &err);
            return Err(err);
        }

        let jobs = match create_jobs(&configuration, &controller, 0, wanted) {
            Ok(jobs) => jobs,
            Err(err) => {
                self.report_setup_failure(&controller, &err);
                return Err(err);
            }
        };

        self.ledger.register(configuration, controller);
        let launched = self.launch(&id, jobs);
        if launched == 0 {
            self.ledger.remove(&id);
            return Err(SchedulerError::Stopped);
        }

        info!(configuration = %id, replications = launched, "Configuration started");
        Ok(SubmitOutcome::Started {
            replications: launched,
        })
    }

    /// Asks the criterion for more replications and launches them.
    /// Returns the number of jobs created.
    pub(super) fn schedule_more(&mut self, id: &ConfigurationId) -> usize {
        if self.shared.is_stopping() {
            return 0;
        }
        let Some(entry) = self.ledger.get(id) else {
            return 0;
        };

        let wanted = entry.configuration().allowed_replications(entry.results());
        if wanted == 0 {
            return 0;
        }

        let configuration = entry.configuration().clone();
        let controller = Arc::clone(entry.controller());
        let first = entry.planned();

        match create_jobs(&configuration, &controller, first, wanted) {
            Ok(jobs) => {
                debug!(configuration = %id, wanted, "Scheduling more replications");
                self.launch(id, jobs)
            }
            Err(err) => {
                self.report_setup_failure(&controller, &err);
                0
            }
        }
    }

    /// Registers jobs with their entry and hands them to the pool.
    fn launch(&mut self, id: &ConfigurationId, jobs: Vec<Arc<Job>>) -> usize {
        let Some(entry) = self.ledger.get_mut(id) else {
            return 0;
        };

        let mut launched = 0;
        for job in jobs {
            entry.add_job(Arc::clone(&job));
            entry.controller().on_job_created(&job);
            match self.pool.submit(Arc::clone(&job)) {
                Ok(()) => launched += 1,
                Err(e) => {
                    warn!(
                        configuration = %id,
                        job_id = %job.id(),
                        error = %e,
                        "Job rejected by worker pool"
                    );
                    entry.withdraw_job(&job.id());
                    job.force_cancel();
                    let withdrawn = RunResult::withdrawn(&job, e.to_string());
                    entry
                        .controller()
                        .on_replication_completed(&job, &withdrawn, false);
                }
            }
        }

        self.shared.metrics.record_jobs_created(launched);
        launched
    }

    /// Starts queued submissions while there is room.
    pub(super) fn start_backlog(&mut self) {
        while !self.shared.is_stopping() && self.has_capacity() {
            let Some(pending) = self.ledger.pop_backlog() else {
                break;
            };
            let id = pending.configuration.id().clone();
            match self.start_configuration(pending.configuration, pending.controller) {
                Ok(outcome) => {
                    debug!(configuration = %id, ?outcome, "Started queued configuration")
                }
                Err(e) => {
                    debug!(configuration = %id, error = %e, "Queued configuration failed to start")
                }
            }
        }
    }

    fn report_setup_failure(&self, controller: &Arc<dyn Controller>, err: &SchedulerError) {
        self.shared.report(err, "setup");
        if let Some(id) = err.configuration() {
            controller.on_setup_failed(id, &RunResult::setup_failure(id, err.to_string()));
        }
    }
}

/// Creates `count` jobs starting at replication index `first`.
///
/// All jobs are prepared before any is returned, so a setup fault leaves
/// nothing half-registered.
fn create_jobs(
    configuration: &TaskConfiguration,
    controller: &Arc<dyn Controller>,
    first: usize,
    count: usize,
) -> Result<Vec<Arc<Job>>, SchedulerError> {
    (first..first + count)
        .map(|replication| {
            configuration
                .simulation()
                .prepare(configuration, replication)
                .map_err(|e| SchedulerError::Setup {
                    configuration: configuration.id().clone(),
                    message: e.to_string(),
                })?;
            Ok(Arc::new(Job::new(
                configuration.clone(),
                replication,
                Arc::clone(controller),
            )))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::configuration::{ReplicationContext, ReplicationCriterion, Simulation};
    use crate::scheduler::controller::NoopController;
    use crate::scheduler::job::RunStatus;

    struct FailingPrepare;

    impl Simulation for FailingPrepare {
        fn run(&self, _context: &ReplicationContext) -> anyhow::Result<Option<serde_json::Value>> {
            Ok(None)
        }

        fn prepare(
            &self,
            _configuration: &TaskConfiguration,
            replication: usize,
        ) -> anyhow::Result<()> {
            if replication == 1 {
                anyhow::bail!("missing input file");
            }
            Ok(())
        }
    }

    fn fixed(n: usize) -> Arc<dyn ReplicationCriterion> {
        Arc::new(move |_c: &TaskConfiguration, past: &[RunResult]| n.saturating_sub(past.len()))
    }

    #[test]
    fn test_create_jobs_numbers_replications() {
        let simulation: Arc<dyn Simulation> =
            Arc::new(|_ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
                Ok(None)
            });
        let configuration = TaskConfiguration::new("numbering", simulation, fixed(3));
        let controller: Arc<dyn Controller> = Arc::new(NoopController);

        let jobs = create_jobs(&configuration, &controller, 2, 3).unwrap();
        let replications: Vec<_> = jobs.iter().map(|j| j.replication()).collect();
        assert_eq!(replications, vec![2, 3, 4]);
    }

    #[test]
    fn test_create_jobs_setup_fault() {
        let configuration = TaskConfiguration::new("broken", Arc::new(FailingPrepare), fixed(3));
        let controller: Arc<dyn Controller> = Arc::new(NoopController);

        let err = create_jobs(&configuration, &controller, 0, 3).unwrap_err();
        assert!(matches!(err, SchedulerError::Setup { .. }));
        assert!(err.to_string().contains("missing input file"));
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        let result = Scheduler::new(SchedulerConfig::new(0));
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_builder_requires_runtime() {
        let result = Scheduler::new(SchedulerConfig::new(1));
        assert!(matches!(result, Err(SchedulerError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_refuses_work() {
        let scheduler = Scheduler::new(SchedulerConfig::new(2)).unwrap();
        assert_eq!(scheduler.num_workers(), 2);

        scheduler.stop().await.unwrap();
        scheduler.stop().await.unwrap();

        let simulation: Arc<dyn Simulation> =
            Arc::new(|_ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
                Ok(None)
            });
        let configuration = TaskConfiguration::new("late", simulation, fixed(1));
        let result = scheduler.submit(configuration, Arc::new(NoopController)).await;
        assert!(matches!(result, Err(SchedulerError::Stopped)));
        assert!(scheduler.status("late").await.is_none());
    }

    #[derive(Default)]
    struct Recorder {
        created: std::sync::Mutex<usize>,
        completions: std::sync::Mutex<Vec<(RunStatus, bool)>>,
    }

    impl Controller for Recorder {
        fn on_job_created(&self, _job: &Arc<Job>) {
            *self.created.lock().unwrap() += 1;
        }

        fn on_replication_completed(&self, _job: &Arc<Job>, result: &RunResult, is_last: bool) {
            self.completions.lock().unwrap().push((result.status, is_last));
        }
    }

    #[tokio::test]
    async fn test_rejected_job_is_reported_to_controller() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = CompletionSender::new(tx);
        // Never started, so every submission is rejected.
        let pool = Arc::new(WorkerPool::new(1, sender));
        let shared = Arc::new(SchedulerShared::new(
            SchedulerConfig::new(1),
            None,
            Arc::new(TracingErrorSink),
        ));
        let mut pipeline = CompletionPipeline::new(rx, pool, shared);

        let simulation: Arc<dyn Simulation> =
            Arc::new(|_ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
                Ok(None)
            });
        let recorder = Arc::new(Recorder::default());
        let result = pipeline.handle_submit(
            TaskConfiguration::new("refused", simulation, fixed(2)),
            recorder.clone(),
        );

        assert!(matches!(result, Err(SchedulerError::Stopped)));
        assert_eq!(*recorder.created.lock().unwrap(), 2);
        let completions = recorder.completions.lock().unwrap().clone();
        assert_eq!(completions, vec![(RunStatus::Cancelled, false); 2]);
        assert!(pipeline.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_configuration() {
        let scheduler = Scheduler::new(SchedulerConfig::new(1)).unwrap();
        let outcome = scheduler.cancel_configuration("nobody").await.unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
        scheduler.stop().await.unwrap();
    }
}
