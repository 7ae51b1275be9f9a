//! CLI command definitions for replication_forge.
//!
//! `run` pushes a batch of Monte Carlo π configurations through the scheduler
//! and prints a JSON summary; `workers` shows how a signed worker count
//! resolves on this machine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use super::monte_carlo::MonteCarloPi;
use crate::criteria::{metric_values, ConfidenceIntervalCriterion, FixedReplications, SampleSummary};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    available_parallelism, resolve_worker_count, ConfigurationId, Controller, Job,
    ReplicationCriterion, RunResult, RunStatus, Scheduler, SchedulerConfig, Simulation,
    TaskConfiguration,
};

/// Payload field written by the demo simulation.
const ESTIMATE_METRIC: &str = "estimate";

/// Concurrent replication scheduler for simulation experiments.
#[derive(Parser)]
#[command(name = "replication-forge")]
#[command(about = "Run replicated simulation experiments on a bounded worker pool")]
#[command(version)]
#[command(
    long_about = "replication-forge schedules independent replications of simulation task configurations on a fixed pool of workers, asking a stopping criterion after each completed round whether more are needed.\n\nExample usage:\n  replication-forge run --configurations 8 --workers -1 --precision 0.001"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Estimate π with several replicated Monte Carlo configurations.
    Run(RunArgs),

    /// Print the number of workers a signed worker count resolves to.
    Workers(WorkersArgs),
}

/// Arguments for `replication-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of task configurations to submit.
    #[arg(short = 'c', long, default_value = "4")]
    pub configurations: usize,

    /// Signed worker count: N workers, or -k for "all cores but k-1".
    #[arg(
        short = 'w',
        long,
        default_value = "-1",
        env = "REPLICATION_WORKERS",
        allow_negative_numbers = true
    )]
    pub workers: i32,

    /// Samples drawn by each replication.
    #[arg(short = 's', long, default_value = "100000")]
    pub samples: u64,

    /// Replications per configuration (fixed criterion).
    #[arg(short = 'r', long, default_value = "10")]
    pub replications: usize,

    /// Relative precision of the π estimate; switches to the
    /// confidence-interval criterion.
    #[arg(short = 'p', long)]
    pub precision: Option<f64>,

    /// Upper bound on replications for the confidence-interval criterion.
    #[arg(long, default_value = "200")]
    pub max_replications: usize,

    /// Base seed for the random streams.
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Park submissions beyond this many active configurations.
    #[arg(long)]
    pub max_active: Option<usize>,

    /// Seconds to wait for running replications on shutdown.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout_secs: u64,

    /// Print Prometheus metrics after the summary.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `replication-forge workers`.
#[derive(Parser, Debug)]
pub struct WorkersArgs {
    /// Signed worker count to resolve.
    #[arg(allow_negative_numbers = true)]
    pub requested: i32,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_replications_command(args).await?,
        Commands::Workers(args) => run_workers_command(args)?,
    }
    Ok(())
}

fn run_workers_command(args: WorkersArgs) -> anyhow::Result<()> {
    let available = available_parallelism();
    let resolved = resolve_worker_count(args.requested, available)?;
    let output = json!({
        "requested": args.requested,
        "available_parallelism": available,
        "workers": resolved,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_replications_command(args: RunArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    let mut config = SchedulerConfig::new(args.workers)
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs));
    if let Some(max) = args.max_active {
        config = config.with_max_active_configurations(max);
    }
    let scheduler = Scheduler::new(config)?;

    let simulation: Arc<dyn Simulation> = Arc::new(MonteCarloPi::new(args.samples, args.seed));
    let criterion = build_criterion(&args);
    let controller = Arc::new(SummaryController::new());

    let mut submitted = BTreeSet::new();
    for i in 0..args.configurations {
        let configuration = TaskConfiguration::new(
            format!("pi-{:03}", i),
            Arc::clone(&simulation),
            Arc::clone(&criterion),
        )
        .with_parameters(json!({"samples": args.samples, "seed": args.seed}));

        let id = configuration.id().clone();
        match scheduler.submit(configuration, controller.clone()).await {
            Ok(outcome) => {
                info!(configuration = %id, ?outcome, "Submitted configuration");
                submitted.insert(id);
            }
            Err(e) => warn!(configuration = %id, error = %e, "Submission rejected"),
        }
    }

    tokio::select! {
        _ = controller.wait_for_finished(&submitted) => {
            info!(configurations = submitted.len(), "All configurations finished");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling all configurations");
            let cancelled = scheduler.cancel_all(|_| true).await?;
            info!(cancelled, "Cancellation requested");
        }
    }

    let stats = scheduler.pool_stats();
    scheduler.stop().await?;

    let output = RunOutput {
        workers: stats.num_workers,
        peak_running: stats.peak_running,
        replications_succeeded: stats.jobs_completed,
        replications_failed: stats.jobs_failed,
        replications_cancelled: stats.jobs_cancelled,
        average_replication_ms: stats.average_job_duration.as_millis() as u64,
        configurations: controller.summaries(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

fn build_criterion(args: &RunArgs) -> Arc<dyn ReplicationCriterion> {
    match args.precision {
        Some(precision) => {
            let min = args.max_replications.min(10);
            Arc::new(
                ConfidenceIntervalCriterion::new(ESTIMATE_METRIC)
                    .with_relative_precision(precision)
                    .with_bounds(min, args.max_replications),
            )
        }
        None => Arc::new(FixedReplications(args.replications)),
    }
}

/// Summary of one configuration in the JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationSummary {
    pub id: ConfigurationId,
    pub replications: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<SampleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConfigurationSummary {
    fn from_results(id: ConfigurationId, results: &[RunResult], error: Option<String>) -> Self {
        let count = |status: RunStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            id,
            replications: results.len(),
            succeeded: count(RunStatus::Succeeded),
            failed: count(RunStatus::Failed),
            cancelled: count(RunStatus::Cancelled),
            estimate: SampleSummary::from_values(&metric_values(results, ESTIMATE_METRIC), 1.96),
            error,
        }
    }
}

/// Output of the `run` command.
#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub workers: usize,
    pub peak_running: usize,
    pub replications_succeeded: u64,
    pub replications_failed: u64,
    pub replications_cancelled: u64,
    pub average_replication_ms: u64,
    pub configurations: Vec<ConfigurationSummary>,
}

#[derive(Default)]
struct Collected {
    results: BTreeMap<ConfigurationId, Vec<RunResult>>,
    errors: BTreeMap<ConfigurationId, String>,
    finished: BTreeSet<ConfigurationId>,
}

/// Controller shared by every configuration of a run. Collects results and
/// tracks which configurations have finished.
///
/// A configuration can be reported finished twice (a setup failure while
/// scheduling more, then its last replication), so finishing is keyed by id.
struct SummaryController {
    collected: Mutex<Collected>,
    finished: watch::Sender<usize>,
}

impl SummaryController {
    fn new() -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            collected: Mutex::new(Collected::default()),
            finished,
        }
    }

    /// Resolves once every id in `ids` has finished.
    async fn wait_for_finished(&self, ids: &BTreeSet<ConfigurationId>) {
        let mut rx = self.finished.subscribe();
        // Only fails if the sender is dropped, which cannot happen while `self` lives.
        let _ = rx.wait_for(|_| ids.is_subset(&self.lock().finished)).await;
    }

    fn mark_finished(&self, id: &ConfigurationId) {
        let newly = self.lock().finished.insert(id.clone());
        if newly {
            self.finished.send_modify(|n| *n += 1);
        }
    }

    fn summaries(&self) -> Vec<ConfigurationSummary> {
        let collected = self.lock();
        let mut ids: Vec<&ConfigurationId> =
            collected.results.keys().chain(collected.errors.keys()).collect();
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .map(|id| {
                let results = collected.results.get(id).map(Vec::as_slice).unwrap_or(&[]);
                ConfigurationSummary::from_results(
                    id.clone(),
                    results,
                    collected.errors.get(id).cloned(),
                )
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collected> {
        self.collected.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Controller for SummaryController {
    fn on_replication_completed(&self, job: &Arc<Job>, result: &RunResult, is_last: bool) {
        self.lock()
            .results
            .entry(job.configuration_id().clone())
            .or_default()
            .push(result.clone());
        if is_last {
            self.mark_finished(job.configuration_id());
        }
    }

    fn on_setup_failed(&self, configuration: &ConfigurationId, result: &RunResult) {
        let message = result.error.clone().unwrap_or_default();
        self.lock().errors.insert(configuration.clone(), message);
        self.mark_finished(configuration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["replication-forge", "run"]).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.configurations, 4);
                assert_eq!(args.samples, 100_000);
                assert_eq!(args.replications, 10);
                assert!(args.precision.is_none());
                assert!(args.max_active.is_none());
                assert!(!args.metrics);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "replication-forge",
            "run",
            "-c",
            "8",
            "-w",
            "-2",
            "--precision",
            "0.01",
            "--max-active",
            "3",
            "--metrics",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.configurations, 8);
                assert_eq!(args.workers, -2);
                assert_eq!(args.precision, Some(0.01));
                assert_eq!(args.max_active, Some(3));
                assert!(args.metrics);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_workers_command_accepts_negative_counts() {
        let cli =
            Cli::try_parse_from(["replication-forge", "workers", "-3"]).expect("should parse");
        match cli.command {
            Commands::Workers(args) => assert_eq!(args.requested, -3),
            _ => panic!("Expected Workers command"),
        }
    }

    #[test]
    fn test_configuration_summary_counts() {
        let simulation: Arc<dyn Simulation> = Arc::new(MonteCarloPi::new(10, 1));
        let config = TaskConfiguration::new("pi-000", simulation, Arc::new(FixedReplications(3)));
        let controller: Arc<dyn Controller> = Arc::new(SummaryController::new());
        let job = Job::new(config, 0, controller);
        let results = vec![
            RunResult::success(&job, "worker-0", Some(json!({"estimate": 3.1})), 5),
            RunResult::success(&job, "worker-1", Some(json!({"estimate": 3.2})), 5),
            RunResult::failure(&job, "worker-0", "boom", 5),
        ];

        let summary =
            ConfigurationSummary::from_results(ConfigurationId::new("pi-000"), &results, None);
        assert_eq!(summary.replications, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        let estimate = summary.estimate.unwrap();
        assert!((estimate.mean - 3.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_summary_controller_counts_finished_configurations() {
        let controller = Arc::new(SummaryController::new());
        let simulation: Arc<dyn Simulation> = Arc::new(MonteCarloPi::new(10, 1));
        let config = TaskConfiguration::new("pi-001", simulation, Arc::new(FixedReplications(1)));
        let job = Arc::new(Job::new(config, 0, controller.clone()));

        controller.on_replication_completed(&job, &RunResult::success(&job, "w", None, 1), true);
        controller.on_setup_failed(
            &ConfigurationId::new("pi-002"),
            &RunResult::setup_failure(&ConfigurationId::new("pi-002"), "no samples"),
        );

        let ids: BTreeSet<_> = ["pi-001", "pi-002"]
            .into_iter()
            .map(ConfigurationId::new)
            .collect();
        tokio::time::timeout(Duration::from_secs(1), controller.wait_for_finished(&ids))
            .await
            .expect("both configurations should count as finished");

        let summaries = controller.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].error.as_deref(), Some("no samples"));
    }

    #[tokio::test]
    async fn test_configuration_finishing_twice_counts_once() {
        let controller = Arc::new(SummaryController::new());
        let simulation: Arc<dyn Simulation> = Arc::new(MonteCarloPi::new(10, 1));
        let config = TaskConfiguration::new("pi-003", simulation, Arc::new(FixedReplications(4)));
        let job = Arc::new(Job::new(config, 0, controller.clone()));
        let pending = ConfigurationId::new("pi-004");

        // Setup failure while scheduling more, then the final replication.
        controller.on_setup_failed(
            job.configuration_id(),
            &RunResult::setup_failure(job.configuration_id(), "prepare failed"),
        );
        controller.on_replication_completed(&job, &RunResult::success(&job, "w", None, 1), true);
        assert_eq!(*controller.finished.borrow(), 1);

        let ids: BTreeSet<_> = [job.configuration_id().clone(), pending.clone()]
            .into_iter()
            .collect();
        let early = tokio::time::timeout(
            Duration::from_millis(100),
            controller.wait_for_finished(&ids),
        )
        .await;
        assert!(early.is_err(), "pi-004 has not finished yet");

        controller.on_setup_failed(&pending, &RunResult::setup_failure(&pending, "no samples"));
        tokio::time::timeout(Duration::from_secs(1), controller.wait_for_finished(&ids))
            .await
            .expect("all configurations should count as finished");
    }
}
