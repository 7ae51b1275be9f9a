//! Monte Carlo estimation of π, the demo workload of the CLI.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::bail;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};

use crate::scheduler::{ReplicationContext, Simulation, TaskConfiguration};

/// Samples between two looks at the cancellation flag.
const CANCELLATION_CHECK_INTERVAL: u64 = 1024;

/// Estimates π by sampling points in the unit square.
///
/// Each replication gets its own deterministic stream derived from the base
/// seed, the configuration id and the replication index.
#[derive(Debug, Clone, Copy)]
pub struct MonteCarloPi {
    pub samples: u64,
    pub seed: u64,
}

impl MonteCarloPi {
    pub fn new(samples: u64, seed: u64) -> Self {
        Self { samples, seed }
    }

    fn stream_seed(&self, context: &ReplicationContext) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        context.configuration.id().hash(&mut hasher);
        context.replication.hash(&mut hasher);
        hasher.finish()
    }
}

impl Simulation for MonteCarloPi {
    fn run(&self, context: &ReplicationContext) -> anyhow::Result<Option<Value>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.stream_seed(context));
        let mut inside = 0u64;

        for i in 0..self.samples {
            if i % CANCELLATION_CHECK_INTERVAL == 0 && context.is_cancelled() {
                bail!("cancelled after {} of {} samples", i, self.samples);
            }
            let x: f64 = rng.random_range(0.0..1.0);
            let y: f64 = rng.random_range(0.0..1.0);
            if x * x + y * y <= 1.0 {
                inside += 1;
            }
        }

        let estimate = 4.0 * inside as f64 / self.samples as f64;
        Ok(Some(json!({
            "estimate": estimate,
            "samples": self.samples,
        })))
    }

    fn prepare(
        &self,
        configuration: &TaskConfiguration,
        _replication: usize,
    ) -> anyhow::Result<()> {
        if self.samples == 0 {
            bail!("configuration '{}' asks for zero samples", configuration.id());
        }
        Ok(())
    }
}
