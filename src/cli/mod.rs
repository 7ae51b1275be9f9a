//! Command-line interface for replication_forge.
//!
//! Provides a demo `run` command that drives Monte Carlo configurations
//! through the scheduler, and a `workers` helper.

mod commands;
pub mod monte_carlo;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
pub use monte_carlo::MonteCarloPi;
