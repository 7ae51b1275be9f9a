//! Per-configuration bookkeeping.
//!
//! The ledger is owned by the completion pipeline task and never shared.
//! For every registered task configuration it keeps the active jobs, the
//! ordered results reported so far and the planned replication count.
//!
//! Invariant: `planned >= results.len()`. The stopping criterion is only
//! consulted when the two are equal, i.e. when no planned replication is
//! still unreported.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use super::configuration::{ConfigurationId, TaskConfiguration};
use super::controller::Controller;
use super::job::{Job, JobId, RunResult};

/// Bookkeeping for one task configuration.
pub struct LedgerEntry {
    configuration: TaskConfiguration,
    controller: Arc<dyn Controller>,
    active: HashMap<JobId, Arc<Job>>,
    results: Vec<RunResult>,
    planned: usize,
    cancelling: bool,
}

impl LedgerEntry {
    fn new(configuration: TaskConfiguration, controller: Arc<dyn Controller>) -> Self {
        Self {
            configuration,
            controller,
            active: HashMap::new(),
            results: Vec::new(),
            planned: 0,
            cancelling: false,
        }
    }

    pub fn configuration(&self) -> &TaskConfiguration {
        &self.configuration
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    pub fn planned(&self) -> usize {
        self.planned
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn active_jobs(&self) -> impl Iterator<Item = &Arc<Job>> {
        self.active.values()
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling
    }

    /// Registers a newly created job and counts it as planned.
    pub fn add_job(&mut self, job: Arc<Job>) {
        self.planned += 1;
        self.active.insert(job.id(), job);
    }

    /// Undoes `add_job` for a job that never reached the worker pool.
    pub fn withdraw_job(&mut self, job_id: &JobId) -> Option<Arc<Job>> {
        let job = self.active.remove(job_id)?;
        self.planned -= 1;
        Some(job)
    }

    /// Removes a reported job from the active set.
    pub fn complete_job(&mut self, job_id: &JobId) -> Option<Arc<Job>> {
        self.active.remove(job_id)
    }

    pub fn push_result(&mut self, result: RunResult) {
        self.results.push(result);
        debug_assert!(self.planned >= self.results.len());
    }

    /// True when every planned replication has reported.
    pub fn awaiting_evaluation(&self) -> bool {
        self.planned == self.results.len()
    }

    /// Marks the entry as cancelling. Returns false if it already was.
    pub fn begin_cancel(&mut self) -> bool {
        if self.cancelling {
            return false;
        }
        self.cancelling = true;
        true
    }

    pub fn status(&self) -> ConfigurationStatus {
        ConfigurationStatus {
            id: self.configuration.id().clone(),
            active_jobs: self.active.len(),
            results: self.results.len(),
            planned: self.planned,
            cancelling: self.cancelling,
        }
    }
}

/// A submission waiting in the todo backlog.
pub struct PendingSubmission {
    pub configuration: TaskConfiguration,
    pub controller: Arc<dyn Controller>,
}

/// Point-in-time view of a configuration's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationStatus {
    pub id: ConfigurationId,
    pub active_jobs: usize,
    pub results: usize,
    pub planned: usize,
    pub cancelling: bool,
}

/// The scheduler's per-configuration bookkeeping plus the todo backlog.
#[derive(Default)]
pub struct Ledger {
    entries: HashMap<ConfigurationId, LedgerEntry>,
    backlog: VecDeque<PendingSubmission>,
    removed: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a configuration. Returns false if the id is already known.
    pub fn register(
        &mut self,
        configuration: TaskConfiguration,
        controller: Arc<dyn Controller>,
    ) -> bool {
        let id = configuration.id().clone();
        if self.is_known(&id) {
            return false;
        }
        self.entries.insert(id, LedgerEntry::new(configuration, controller));
        true
    }

    /// True if the id is registered or waiting in the backlog.
    pub fn is_known(&self, id: &ConfigurationId) -> bool {
        self.entries.contains_key(id) || self.backlog.iter().any(|p| p.configuration.id() == id)
    }

    pub fn get(&self, id: &ConfigurationId) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ConfigurationId) -> Option<&mut LedgerEntry> {
        self.entries.get_mut(id)
    }

    /// Removes an entry. Each configuration is removed at most once.
    pub fn remove(&mut self, id: &ConfigurationId) -> Option<LedgerEntry> {
        let entry = self.entries.remove(id)?;
        self.removed += 1;
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries removed over the ledger's lifetime.
    pub fn removed_count(&self) -> u64 {
        self.removed
    }

    /// Ids of registered configurations whose controller matches `filter`.
    pub fn ids_matching(
        &self,
        filter: &dyn Fn(&Arc<dyn Controller>) -> bool,
    ) -> Vec<ConfigurationId> {
        self.entries
            .iter()
            .filter(|(_, entry)| filter(&entry.controller))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Parks a submission in the backlog. Returns its 1-based position.
    pub fn enqueue_backlog(&mut self, submission: PendingSubmission) -> usize {
        self.backlog.push_back(submission);
        self.backlog.len()
    }

    pub fn pop_backlog(&mut self) -> Option<PendingSubmission> {
        self.backlog.pop_front()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Drops the backlog entry for `id`. Returns true if one was removed.
    pub fn remove_from_backlog(&mut self, id: &ConfigurationId) -> bool {
        let before = self.backlog.len();
        self.backlog.retain(|p| p.configuration.id() != id);
        before != self.backlog.len()
    }

    /// Drops every backlog entry whose controller matches `filter`.
    /// Returns the number removed.
    pub fn remove_backlog_matching(
        &mut self,
        filter: &dyn Fn(&Arc<dyn Controller>) -> bool,
    ) -> usize {
        let before = self.backlog.len();
        self.backlog.retain(|p| !filter(&p.controller));
        before - self.backlog.len()
    }

    /// Empties the ledger, returning every job that never reported.
    pub fn drain_active_jobs(&mut self) -> Vec<Arc<Job>> {
        self.backlog.clear();
        self.entries
            .drain()
            .flat_map(|(_, entry)| entry.active.into_values())
            .collect()
    }
}
