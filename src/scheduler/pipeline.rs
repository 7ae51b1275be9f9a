//! Completion pipeline: the single consumer that owns the ledger.
//!
//! Workers and the public `Scheduler` API talk to the pipeline through one
//! unbounded channel, so every ledger decision (reconciling a completion,
//! registering a submission, cancelling) is taken in FIFO order by a single
//! task. No lock guards the ledger.
//!
//! The loop ends on `PipelineMessage::Poison` and hands the ledger back to
//! whoever awaits the task, which is how `stop()` finds jobs that never
//! reported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::SchedulerError;
use crate::metrics::MetricsCollector;

use super::config::SchedulerConfig;
use super::configuration::{ConfigurationId, TaskConfiguration};
use super::controller::{CompletionStorage, Controller, ErrorSink};
use super::job::{Job, RunResult};
use super::ledger::{ConfigurationStatus, Ledger};
use super::orchestrator::{CancelOutcome, SubmitOutcome};
use super::worker_pool::WorkerPool;

/// A finished job together with its result.
pub struct CompletionEnvelope {
    pub job: Arc<Job>,
    pub result: RunResult,
}

/// Predicate over controllers used by `cancel_all`.
pub(crate) type ControllerFilter = Box<dyn Fn(&Arc<dyn Controller>) -> bool + Send>;

/// Everything the pipeline can be asked to do.
pub(crate) enum PipelineMessage {
    Completed(CompletionEnvelope),
    Submit {
        configuration: TaskConfiguration,
        controller: Arc<dyn Controller>,
        reply: oneshot::Sender<Result<SubmitOutcome, SchedulerError>>,
    },
    Cancel {
        configuration: ConfigurationId,
        reply: oneshot::Sender<CancelOutcome>,
    },
    CancelAll {
        filter: ControllerFilter,
        reply: oneshot::Sender<usize>,
    },
    Inspect {
        configuration: ConfigurationId,
        reply: oneshot::Sender<Option<ConfigurationStatus>>,
    },
    Poison,
}

/// Cloneable handle for sending messages to the pipeline.
#[derive(Clone)]
pub(crate) struct CompletionSender(mpsc::UnboundedSender<PipelineMessage>);

impl CompletionSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PipelineMessage>) -> Self {
        Self(tx)
    }

    /// Forwards a completion. Never blocks. Returns false once the pipeline is gone.
    pub(crate) fn deliver(&self, job: Arc<Job>, result: RunResult) -> bool {
        self.send(PipelineMessage::Completed(CompletionEnvelope { job, result }))
    }

    pub(crate) fn send(&self, message: PipelineMessage) -> bool {
        self.0.send(message).is_ok()
    }
}

/// State shared between the public API, the pipeline and shutdown.
pub(crate) struct SchedulerShared {
    pub(crate) config: SchedulerConfig,
    stopping: AtomicBool,
    pub(crate) storage: Option<Arc<dyn CompletionStorage>>,
    pub(crate) error_sink: Arc<dyn ErrorSink>,
    pub(crate) metrics: MetricsCollector,
}

impl SchedulerShared {
    pub(crate) fn new(
        config: SchedulerConfig,
        storage: Option<Arc<dyn CompletionStorage>>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            config,
            stopping: AtomicBool::new(false),
            storage,
            error_sink,
            metrics: MetricsCollector::new(),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Sets the stopping flag. Returns true for the first caller.
    pub(crate) fn begin_stopping(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    /// Hands a fault to the error sink and counts it.
    pub(crate) fn report(&self, err: &SchedulerError, kind: &str) {
        self.metrics.record_fault(kind);
        self.error_sink.report(err);
    }
}

/// The single consumer of completions and control requests.
pub(crate) struct CompletionPipeline {
    pub(super) ledger: Ledger,
    pub(super) inbox: mpsc::UnboundedReceiver<PipelineMessage>,
    pub(super) pool: Arc<WorkerPool>,
    pub(super) shared: Arc<SchedulerShared>,
}

impl CompletionPipeline {
    pub(crate) fn new(
        inbox: mpsc::UnboundedReceiver<PipelineMessage>,
        pool: Arc<WorkerPool>,
        shared: Arc<SchedulerShared>,
    ) -> Self {
        Self {
            ledger: Ledger::new(),
            inbox,
            pool,
            shared,
        }
    }

    /// Processes messages until poisoned, then returns the ledger.
    pub(crate) async fn run(mut self) -> Ledger {
        debug!("Completion pipeline started");

        while let Some(message) = self.inbox.recv().await {
            match message {
                PipelineMessage::Completed(envelope) => {
                    self.reconcile(envelope.job, envelope.result);
                }
                PipelineMessage::Submit {
                    configuration,
                    controller,
                    reply,
                } => {
                    let outcome = self.handle_submit(configuration, controller);
                    let _ = reply.send(outcome);
                }
                PipelineMessage::Cancel {
                    configuration,
                    reply,
                } => {
                    let outcome = self.handle_cancel(&configuration);
                    let _ = reply.send(outcome);
                }
                PipelineMessage::CancelAll { filter, reply } => {
                    let cancelled = self.handle_cancel_all(&*filter);
                    let _ = reply.send(cancelled);
                }
                PipelineMessage::Inspect {
                    configuration,
                    reply,
                } => {
                    let _ = reply.send(self.ledger.get(&configuration).map(|e| e.status()));
                }
                PipelineMessage::Poison => {
                    debug!("Completion pipeline received poison");
                    break;
                }
            }
            self.shared
                .metrics
                .set_ledger_size(self.ledger.len(), self.ledger.backlog_len());
        }

        info!(
            remaining = self.ledger.len(),
            removed = self.ledger.removed_count(),
            "Completion pipeline stopped"
        );
        self.ledger
    }

    /// Folds one completion into the ledger and decides what happens next.
    pub(super) fn reconcile(&mut self, job: Arc<Job>, result: RunResult) {
        let id = job.configuration_id().clone();
        let job_id = job.id();

        let Some(entry) = self.ledger.get_mut(&id) else {
            self.bookkeeping_fault(&job, "configuration is not registered");
            return;
        };
        if entry.complete_job(&job_id).is_none() {
            self.bookkeeping_fault(&job, "job is not active for its configuration");
            return;
        }

        let controller = Arc::clone(entry.controller());

        // In flight when stop() began: not history, no criterion, no storage.
        // The entry stays in the ledger for stop() to drain.
        if self.shared.is_stopping() {
            debug!(
                configuration = %id,
                job_id = %job_id,
                "Discarding result that arrived during shutdown"
            );
            controller.on_replication_completed(
                &job,
                &result.discard("scheduler is stopping"),
                false,
            );
            return;
        }

        if entry.is_cancelling() {
            let is_last = entry.active_len() == 0;
            debug!(
                configuration = %id,
                job_id = %job_id,
                is_last,
                "Discarding result of cancelled configuration"
            );
            controller.on_replication_completed(
                &job,
                &result.discard("configuration was cancelled"),
                is_last,
            );
            if is_last {
                self.remove_entry(&id);
            }
            return;
        }

        entry.push_result(result.clone());
        let persistent = entry.configuration().has_persistent_storage();

        let created = if entry.awaiting_evaluation() {
            self.schedule_more(&id)
        } else {
            0
        };
        let active = self.ledger.get(&id).map_or(0, |e| e.active_len());
        let is_last = active == 0 && created == 0;

        debug!(
            configuration = %id,
            job_id = %job_id,
            status = %result.status,
            created,
            active,
            is_last,
            "Reconciled replication"
        );
        controller.on_replication_completed(&job, &result, is_last);

        if is_last {
            if persistent {
                if let Some(storage) = &self.shared.storage {
                    storage.on_configuration_done(&result.completion_id);
                }
            }
            self.remove_entry(&id);
        }
    }

    /// Cancels one configuration, or drops it from the backlog.
    pub(super) fn handle_cancel(&mut self, id: &ConfigurationId) -> CancelOutcome {
        if self.ledger.remove_from_backlog(id) {
            info!(configuration = %id, "Dropped queued configuration");
            return CancelOutcome::Dequeued;
        }

        let Some(entry) = self.ledger.get_mut(id) else {
            return CancelOutcome::NotFound;
        };
        if !entry.begin_cancel() {
            return CancelOutcome::AlreadyCancelling;
        }

        for job in entry.active_jobs() {
            job.cancel();
        }
        let jobs = entry.active_len();
        info!(configuration = %id, jobs, "Cancelling configuration");

        if jobs == 0 {
            self.remove_entry(id);
            return CancelOutcome::Removed;
        }
        CancelOutcome::Cancelling { jobs }
    }

    /// Cancels every configuration whose controller matches `filter`.
    pub(super) fn handle_cancel_all(
        &mut self,
        filter: &dyn Fn(&Arc<dyn Controller>) -> bool,
    ) -> usize {
        let mut cancelled = self.ledger.remove_backlog_matching(filter);

        for id in self.ledger.ids_matching(filter) {
            match self.handle_cancel(&id) {
                CancelOutcome::Removed | CancelOutcome::Cancelling { .. } => cancelled += 1,
                _ => {}
            }
        }
        cancelled
    }

    /// Removes a finished entry and lets queued submissions take its slot.
    pub(super) fn remove_entry(&mut self, id: &ConfigurationId) {
        if let Some(entry) = self.ledger.remove(id) {
            debug!(
                configuration = %id,
                results = entry.results().len(),
                "Configuration removed from ledger"
            );
            self.start_backlog();
        }
    }

    fn bookkeeping_fault(&self, job: &Arc<Job>, message: &str) {
        let err = SchedulerError::Bookkeeping {
            configuration: job.configuration_id().clone(),
            job: job.id(),
            message: message.to_string(),
        };
        error!(
            configuration = %job.configuration_id(),
            job_id = %job.id(),
            "{}",
            message
        );
        self.shared.report(&err, "bookkeeping");
        job.controller()
            .on_replication_completed(job, &RunResult::orphaned(job, err.to_string()), true);
    }
}
