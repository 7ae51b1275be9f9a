//! Task configurations and the collaborators they carry.
//!
//! A `TaskConfiguration` describes "what to run": a model plus parameters,
//! identified by a `ConfigurationId` that keys the scheduler's ledger. It
//! carries the two pluggable pieces the scheduler treats as black boxes:
//!
//! - `Simulation`: executes one replication (and may prepare job setup)
//! - `ReplicationCriterion`: decides how many more replications are needed

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::{CancellationFlag, JobId, RunResult};

/// Identifier of a task configuration. Used as the ledger key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigurationId(String);

impl ConfigurationId {
    /// Creates a new identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConfigurationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConfigurationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Everything a single replication run gets to see.
#[derive(Debug, Clone)]
pub struct ReplicationContext {
    /// The configuration being replicated.
    pub configuration: TaskConfiguration,
    /// Job executing this replication.
    pub job_id: JobId,
    /// Zero-based index of the replication within its configuration.
    pub replication: usize,
    /// Advisory cancellation flag. Long-running simulations should poll it.
    pub cancellation: CancellationFlag,
}

impl ReplicationContext {
    /// Shorthand for `self.cancellation.is_cancelled()`.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// The simulation subsystem: runs one replication of a configuration.
///
/// `run` is blocking and is executed on a blocking thread of the runtime.
/// Errors and panics become failure results.
pub trait Simulation: Send + Sync + 'static {
    /// Runs one replication and returns an optional payload.
    fn run(&self, context: &ReplicationContext) -> anyhow::Result<Option<Value>>;

    /// Called once for every job created for `configuration`, before the
    /// job is registered. An error is a setup fault.
    fn prepare(
        &self,
        _configuration: &TaskConfiguration,
        _replication: usize,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> Simulation for F
where
    F: Fn(&ReplicationContext) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
{
    fn run(&self, context: &ReplicationContext) -> anyhow::Result<Option<Value>> {
        self(context)
    }
}

/// Stopping criterion: how many more replications are needed given the
/// results reported so far. Zero means done.
///
/// Never called concurrently for the same configuration, and only with a
/// result list that contains every replication planned so far.
pub trait ReplicationCriterion: Send + Sync + 'static {
    fn allowed_replications(&self, configuration: &TaskConfiguration, past: &[RunResult]) -> usize;
}

impl<F> ReplicationCriterion for F
where
    F: Fn(&TaskConfiguration, &[RunResult]) -> usize + Send + Sync + 'static,
{
    fn allowed_replications(&self, configuration: &TaskConfiguration, past: &[RunResult]) -> usize {
        self(configuration, past)
    }
}

/// The unit of "what to simulate", independent of how many replications run.
#[derive(Clone)]
pub struct TaskConfiguration {
    id: ConfigurationId,
    parameters: Value,
    persistent_storage: bool,
    simulation: Arc<dyn Simulation>,
    criterion: Arc<dyn ReplicationCriterion>,
}

impl TaskConfiguration {
    /// Creates a configuration with empty parameters and no persistent storage.
    pub fn new(
        id: impl Into<ConfigurationId>,
        simulation: Arc<dyn Simulation>,
        criterion: Arc<dyn ReplicationCriterion>,
    ) -> Self {
        Self {
            id: id.into(),
            parameters: Value::Null,
            persistent_storage: false,
            simulation,
            criterion,
        }
    }

    /// Sets the model parameters.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Declares that replications of this configuration write to persistent storage.
    pub fn with_persistent_storage(mut self, enabled: bool) -> Self {
        self.persistent_storage = enabled;
        self
    }

    pub fn id(&self) -> &ConfigurationId {
        &self.id
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn has_persistent_storage(&self) -> bool {
        self.persistent_storage
    }

    pub fn simulation(&self) -> &Arc<dyn Simulation> {
        &self.simulation
    }

    /// Asks the stopping criterion how many more replications are needed.
    pub fn allowed_replications(&self, past: &[RunResult]) -> usize {
        self.criterion.allowed_replications(self, past)
    }
}

impl fmt::Debug for TaskConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfiguration")
            .field("id", &self.id)
            .field("parameters", &self.parameters)
            .field("persistent_storage", &self.persistent_storage)
            .finish_non_exhaustive()
    }
}
