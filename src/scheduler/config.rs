//! Scheduler configuration.
//!
//! This module provides the knobs of the replication scheduler: the signed
//! worker count, the bounded shutdown wait, and the optional limit on how many
//! task configurations may be active before further submissions are parked in
//! the todo backlog.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the replication scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Requested number of workers.
    ///
    /// Positive values are used directly, zero is invalid, and `-k` means
    /// "available parallelism + 1 - k, at least one".
    pub worker_count: i32,
    /// Upper bound on how long `stop()` waits for in-flight replications
    /// before force-cancelling them.
    pub shutdown_timeout: Duration,
    /// Maximum number of task configurations in the ledger at once.
    /// `None` means unbounded.
    pub max_active_configurations: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: -1, // every available core
            shutdown_timeout: Duration::from_secs(60),
            max_active_configurations: None,
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with the given signed worker count.
    pub fn new(worker_count: i32) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REPLICATION_WORKERS`: Signed worker count (default: -1)
    /// - `REPLICATION_SHUTDOWN_TIMEOUT_SECS`: Shutdown wait in seconds (default: 60)
    /// - `REPLICATION_MAX_ACTIVE_CONFIGURATIONS`: Active configuration limit (default: unbounded)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REPLICATION_WORKERS") {
            config.worker_count = parse_env_value(&val, "REPLICATION_WORKERS")?;
        }

        if let Ok(val) = std::env::var("REPLICATION_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "REPLICATION_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("REPLICATION_MAX_ACTIVE_CONFIGURATIONS") {
            config.max_active_configurations = Some(parse_env_value(
                &val,
                "REPLICATION_MAX_ACTIVE_CONFIGURATIONS",
            )?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must not be 0".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "shutdown_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_active_configurations == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_active_configurations must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves the signed worker count against this machine's parallelism.
    pub fn resolved_workers(&self) -> Result<usize, ConfigError> {
        resolve_worker_count(self.worker_count, available_parallelism())
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to limit the number of active configurations.
    pub fn with_max_active_configurations(mut self, max: usize) -> Self {
        self.max_active_configurations = Some(max);
        self
    }
}

/// Number of hardware threads, falling back to 1 when it cannot be queried.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Turns a signed worker count into a concrete number of workers.
///
/// `-1` uses every core, `-2` leaves one core free, and so on. The result is
/// never below one.
pub fn resolve_worker_count(requested: i32, available: usize) -> Result<usize, ConfigError> {
    match requested {
        0 => Err(ConfigError::ValidationFailed(
            "worker_count must not be 0".to_string(),
        )),
        n if n > 0 => Ok(n as usize),
        n => {
            let reserve = n.unsigned_abs() as usize;
            Ok((available + 1).saturating_sub(reserve).max(1))
        }
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
