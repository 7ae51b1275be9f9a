//! Bounded worker pool for replication jobs.
//!
//! This module provides a pool of `N` workers sharing one job queue. Each
//! worker runs as an independent async task, takes one job at a time and
//! executes the blocking simulation on the runtime's blocking threads, so no
//! more than `N` replications ever run at once.
//!
//! # Features
//!
//! - Signed worker count resolution (see `SchedulerConfig`)
//! - Jobs cancelled before they start are skipped, not run
//! - Errors and panics inside a run become failure results
//! - Completions are forwarded to the completion pipeline without waiting
//! - Graceful shutdown with broadcast channel and a bounded wait
//! - Pool statistics tracking, including peak concurrency

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

use super::configuration::ReplicationContext;
use super::job::{Job, JobId, RunResult, RunStatus};
use super::pipeline::CompletionSender;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// The pool no longer accepts jobs.
    #[error("Pool is shutting down; job {0} rejected")]
    Rejected(JobId),

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of replications currently running.
    pub running: usize,
    /// Highest number of replications that ever ran at the same time.
    pub peak_running: usize,
    /// Replications that produced a result.
    pub jobs_completed: u64,
    /// Replications that failed (error or panic).
    pub jobs_failed: u64,
    /// Jobs skipped or ended by cancellation.
    pub jobs_cancelled: u64,
    /// Average run duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_cancelled
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    total_duration_ms: AtomicU64,
    running: AtomicU64,
    peak_running: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            running: AtomicU64::new(0),
            peak_running: AtomicU64::new(0),
        }
    }

    fn record(&self, status: RunStatus, duration: Duration) {
        let counter = match status {
            RunStatus::Succeeded => &self.jobs_completed,
            RunStatus::Failed => &self.jobs_failed,
            RunStatus::Cancelled => &self.jobs_cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_running(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
    }

    fn decrement_running(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let cancelled = self.jobs_cancelled.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + failed + cancelled;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            running: self.running.load(Ordering::SeqCst) as usize,
            peak_running: self.peak_running.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_cancelled: cancelled,
            average_job_duration: average_duration,
        }
    }
}

type JobReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Job>>>>;
type InFlight = Arc<Mutex<HashMap<JobId, Arc<Job>>>>;

/// Pool of workers executing replication jobs.
pub struct WorkerPool {
    num_workers: usize,
    job_tx: mpsc::UnboundedSender<Arc<Job>>,
    job_rx: JobReceiver,
    completions: CompletionSender,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    in_flight: InFlight,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
    accepting: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool with `num_workers` workers that report to `completions`.
    pub(crate) fn new(num_workers: usize, completions: CompletionSender) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            num_workers,
            job_tx,
            job_rx: Arc::new(tokio::sync::Mutex::new(job_rx)),
            completions,
            shutdown_tx,
            worker_handles: Mutex::new(Vec::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
        }
    }

    /// Spawns all workers. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub(crate) fn start(&self) -> Result<(), PoolError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let mut handles = lock(&self.worker_handles);
        for i in 0..self.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                jobs: Arc::clone(&self.job_rx),
                completions: self.completions.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                in_flight: Arc::clone(&self.in_flight),
                stats: Arc::clone(&self.stats),
                metrics: self.metrics.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        self.accepting.store(true, Ordering::SeqCst);
        info!(num_workers = self.num_workers, "Worker pool started");
        Ok(())
    }

    /// Enqueues a job. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Rejected` once shutdown has begun.
    pub fn submit(&self, job: Arc<Job>) -> Result<(), PoolError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::Rejected(job.id()));
        }
        let job_id = job.id();
        job.mark_submitted();
        self.job_tx
            .send(job)
            .map_err(|_| PoolError::Rejected(job_id))?;
        debug!(job_id = %job_id, "Job submitted to worker pool");
        Ok(())
    }

    /// Stops accepting jobs and tells workers to exit after their current job.
    pub(crate) fn signal_shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());
    }

    /// Gracefully shuts down all workers.
    ///
    /// Running replications are allowed to finish. Jobs still queued are left
    /// untouched for the caller to cancel. If the workers do not stop within
    /// `timeout`, every in-flight job is cancelled and the workers are aborted.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool was never started or is
    /// already shut down, and `PoolError::ShutdownTimeout` if workers had to be
    /// aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.signal_shutdown();

        let handles: Vec<JoinHandle<()>> = lock(&self.worker_handles).drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let shutdown_future = async {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                let stuck: Vec<Arc<Job>> = lock(&self.in_flight).values().cloned().collect();
                warn!(
                    in_flight = stuck.len(),
                    "Worker pool shutdown timed out, cancelling in-flight jobs"
                );
                for job in stuck {
                    job.cancel();
                }
                for handle in abort_handles {
                    handle.abort();
                }
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
}

/// A single worker that processes jobs from the shared queue.
struct Worker {
    id: String,
    jobs: JobReceiver,
    completions: CompletionSender,
    shutdown_rx: broadcast::Receiver<()>,
    in_flight: InFlight,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Takes one job at a time until a shutdown signal is received or the
    /// job queue closes.
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    debug!(worker_id = %self.id, "Worker received shutdown signal");
                    None
                }
                job = next_job(&self.jobs) => job,
            };

            match next {
                Some(job) => self.process_job(job).await,
                None => break,
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single job and forwards its completion.
    async fn process_job(&self, job: Arc<Job>) {
        let job_id = job.id();

        if !job.try_start() {
            job.force_cancel();
            debug!(worker_id = %self.id, job_id = %job_id, "Skipping cancelled job");
            self.stats.record(RunStatus::Cancelled, Duration::ZERO);
            self.metrics
                .record_replication(&RunStatus::Cancelled.to_string(), 0.0);
            let result = RunResult::cancelled(&job, &self.id);
            self.forward(job, result);
            return;
        }

        debug!(
            worker_id = %self.id,
            job_id = %job_id,
            configuration = %job.configuration_id(),
            replication = job.replication(),
            "Running replication"
        );

        lock(&self.in_flight).insert(job_id, Arc::clone(&job));
        self.stats.increment_running();
        self.metrics.replication_started();
        let start_time = Instant::now();

        let context = ReplicationContext {
            configuration: job.configuration().clone(),
            job_id,
            replication: job.replication(),
            cancellation: job.cancellation_flag().clone(),
        };
        let outcome =
            tokio::task::spawn_blocking(move || context.configuration.simulation().run(&context))
                .await;

        let duration = start_time.elapsed();
        let duration_ms = duration.as_millis() as u64;
        self.stats.decrement_running();
        self.metrics.replication_finished();
        lock(&self.in_flight).remove(&job_id);

        let result = match outcome {
            Ok(Ok(payload)) => RunResult::success(&job, &self.id, payload, duration_ms),
            Ok(Err(e)) => {
                warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Replication failed");
                RunResult::failure(&job, &self.id, e.to_string(), duration_ms)
            }
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    panic = %message,
                    "Replication panicked"
                );
                RunResult::failure(
                    &job,
                    &self.id,
                    format!("Replication panicked: {}", message),
                    duration_ms,
                )
            }
            Err(join_error) => {
                RunResult::failure(&job, &self.id, join_error.to_string(), duration_ms)
            }
        };

        let state = job.finish();
        debug!(
            worker_id = %self.id,
            job_id = %job_id,
            state = %state,
            duration_ms,
            "Replication finished"
        );

        self.stats.record(result.status, duration);
        self.metrics
            .record_replication(&result.status.to_string(), duration.as_secs_f64());
        self.forward(job, result);
    }

    fn forward(&self, job: Arc<Job>, result: RunResult) {
        let job_id = job.id();
        if !self.completions.deliver(job, result) {
            debug!(
                worker_id = %self.id,
                job_id = %job_id,
                "Completion pipeline closed; result discarded"
            );
        }
    }
}

async fn next_job(
    jobs: &tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Job>>>,
) -> Option<Arc<Job>> {
    jobs.lock().await.recv().await
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Locks a std mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::configuration::{ReplicationCriterion, Simulation, TaskConfiguration};
    use crate::scheduler::controller::NoopController;
    use crate::scheduler::pipeline::PipelineMessage;
    use std::sync::atomic::AtomicUsize;

    fn configuration(simulation: Arc<dyn Simulation>) -> TaskConfiguration {
        let criterion: Arc<dyn ReplicationCriterion> =
            Arc::new(|_c: &TaskConfiguration, _p: &[RunResult]| 0usize);
        TaskConfiguration::new("pool-test", simulation, criterion)
    }

    fn pool(workers: usize) -> (WorkerPool, mpsc::UnboundedReceiver<PipelineMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerPool::new(workers, CompletionSender::new(tx)), rx)
    }

    async fn next_completion(
        rx: &mut mpsc::UnboundedReceiver<PipelineMessage>,
    ) -> (Arc<Job>, RunResult) {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("completion should arrive")
            .expect("channel open");
        match message {
            PipelineMessage::Completed(envelope) => (envelope.job, envelope.result),
            _ => panic!("expected a completion"),
        }
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.num_workers, 0);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.total_processed(), 0);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(RunStatus::Succeeded, Duration::from_millis(100));
        stats.record(RunStatus::Succeeded, Duration::from_millis(200));
        stats.record(RunStatus::Failed, Duration::from_millis(60));
        stats.record(RunStatus::Cancelled, Duration::ZERO);

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert_eq!(pool_stats.jobs_cancelled, 1);
        assert_eq!(pool_stats.average_job_duration, Duration::from_millis(90));
        assert!((pool_stats.success_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_peak_running_tracking() {
        let stats = SharedPoolStats::new();

        stats.increment_running();
        stats.increment_running();
        stats.decrement_running();
        stats.increment_running();
        stats.decrement_running();
        stats.decrement_running();

        let pool_stats = stats.to_pool_stats(2);
        assert_eq!(pool_stats.running, 0);
        assert_eq!(pool_stats.peak_running, 2);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        let err = PoolError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("kaboom"))), "kaboom");
        assert_eq!(panic_message(Box::new(42u32)), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_submit_before_start_is_rejected() {
        let (pool, _rx) = pool(1);
        let simulation: Arc<dyn Simulation> =
            Arc::new(|_ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
                Ok(None)
            });
        let job = Arc::new(Job::new(configuration(simulation), 0, Arc::new(NoopController)));

        assert!(matches!(pool.submit(job), Err(PoolError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_worker_converts_errors_and_panics() {
        let (pool, mut rx) = pool(1);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        let simulation: Arc<dyn Simulation> = Arc::new(
            |ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
                match ctx.replication {
                    0 => Ok(Some(serde_json::json!({"value": 1.0}))),
                    1 => Err(anyhow::anyhow!("solver diverged")),
                    _ => panic!("numerical blow-up"),
                }
            },
        );
        let config = configuration(simulation);

        for replication in 0..3 {
            let job = Arc::new(Job::new(config.clone(), replication, Arc::new(NoopController)));
            pool.submit(job).unwrap();
        }

        let mut results = Vec::new();
        for _ in 0..3 {
            let (job, result) = next_completion(&mut rx).await;
            assert_eq!(job.state(), crate::scheduler::job::JobState::Completed);
            results.push(result);
        }
        results.sort_by_key(|r| r.replication);

        assert_eq!(results[0].status, RunStatus::Succeeded);
        assert_eq!(results[1].status, RunStatus::Failed);
        assert_eq!(results[1].error.as_deref(), Some("solver diverged"));
        assert_eq!(results[2].status, RunStatus::Failed);
        assert!(results[2].error.as_deref().unwrap().contains("numerical blow-up"));

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_failed, 2);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped_but_reported() {
        let (pool, mut rx) = pool(1);
        pool.start().unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let simulation: Arc<dyn Simulation> = Arc::new(
            move |_ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            },
        );
        let job = Arc::new(Job::new(configuration(simulation), 0, Arc::new(NoopController)));
        job.cancel();
        pool.submit(Arc::clone(&job)).unwrap();

        let (reported, result) = next_completion(&mut rx).await;
        assert_eq!(reported.id(), job.id());
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(job.state(), crate::scheduler::job::JobState::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_timeout_cancels_in_flight_jobs() {
        let (pool, _rx) = pool(1);
        pool.start().unwrap();

        let simulation: Arc<dyn Simulation> = Arc::new(
            |ctx: &ReplicationContext| -> anyhow::Result<Option<serde_json::Value>> {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !ctx.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(None)
            },
        );
        let job = Arc::new(Job::new(configuration(simulation), 0, Arc::new(NoopController)));
        pool.submit(Arc::clone(&job)).unwrap();

        while job.state() != crate::scheduler::job::JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let result = pool.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PoolError::ShutdownTimeout(_))));
        assert!(job.is_cancelled());
        assert!(matches!(
            pool.shutdown(Duration::from_millis(50)).await,
            Err(PoolError::NotRunning)
        ));
    }
}
