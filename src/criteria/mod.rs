//! Ready-made stopping criteria.
//!
//! - `FixedReplications`: a fixed number of replications per configuration
//! - `ConfidenceIntervalCriterion`: sequential sampling until the confidence
//!   interval of a payload metric is narrow enough
//!
//! Any `Fn(&TaskConfiguration, &[RunResult]) -> usize` closure works as well.

use serde::Serialize;

use crate::scheduler::{ReplicationCriterion, RunResult, TaskConfiguration};

/// Runs exactly `n` replications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedReplications(pub usize);

impl ReplicationCriterion for FixedReplications {
    fn allowed_replications(
        &self,
        _configuration: &TaskConfiguration,
        past: &[RunResult],
    ) -> usize {
        self.0.saturating_sub(past.len())
    }
}

/// Keeps replicating until `z * s / sqrt(n) <= relative_precision * |mean|`
/// for the numeric payload field `metric`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceIntervalCriterion {
    /// Payload field read from each successful result.
    pub metric: String,
    /// Target half-width relative to the mean.
    pub relative_precision: f64,
    /// Critical value of the normal distribution (1.96 for 95%).
    pub z: f64,
    /// Replications to run before the interval is first checked.
    pub min_replications: usize,
    /// Hard upper bound on replications.
    pub max_replications: usize,
    /// Replications requested per round once the minimum is reached.
    pub batch: usize,
}

impl ConfidenceIntervalCriterion {
    /// 95% interval within 5% of the mean, between 10 and 1000 replications,
    /// requested in batches of 4.
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            relative_precision: 0.05,
            z: 1.96,
            min_replications: 10,
            max_replications: 1000,
            batch: 4,
        }
    }

    pub fn with_relative_precision(mut self, relative_precision: f64) -> Self {
        self.relative_precision = relative_precision;
        self
    }

    pub fn with_z(mut self, z: f64) -> Self {
        self.z = z;
        self
    }

    pub fn with_bounds(mut self, min_replications: usize, max_replications: usize) -> Self {
        self.min_replications = min_replications;
        self.max_replications = max_replications.max(min_replications);
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }
}

impl ReplicationCriterion for ConfidenceIntervalCriterion {
    fn allowed_replications(
        &self,
        _configuration: &TaskConfiguration,
        past: &[RunResult],
    ) -> usize {
        let done = past.len();
        if done >= self.max_replications {
            return 0;
        }
        if done < self.min_replications {
            return self.min_replications - done;
        }

        let next_batch = self.batch.min(self.max_replications - done);
        let values = metric_values(past, &self.metric);
        let Some(summary) = SampleSummary::from_values(&values, self.z) else {
            return next_batch;
        };

        if summary.half_width <= self.relative_precision * summary.mean.abs() {
            0
        } else {
            next_batch
        }
    }
}

/// Numeric values of `metric` from the successful results' payloads.
pub fn metric_values(results: &[RunResult], metric: &str) -> Vec<f64> {
    results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| r.payload.as_ref()?.get(metric)?.as_f64())
        .collect()
}

/// Mean, sample standard deviation and confidence half-width of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleSummary {
    pub n: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub half_width: f64,
}

impl SampleSummary {
    /// Returns `None` for fewer than two values.
    pub fn from_values(values: &[f64], z: f64) -> Option<Self> {
        let n = values.len();
        if n < 2 {
            return None;
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let std_dev = variance.sqrt();
        Some(Self {
            n,
            mean,
            std_dev,
            half_width: z * std_dev / (n as f64).sqrt(),
        })
    }
}
