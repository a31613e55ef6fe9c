use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings of the job scheduler shared by every job it drives.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Number of past runs kept per job in the registry.
    #[serde(default = "default_run_history_capacity")]
    pub run_history_capacity: usize,
    /// How long, in milliseconds, shutdown waits for running cycles before aborting them.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl SchedulerConfig {
    pub const DEFAULT_RUN_HISTORY_CAPACITY: usize = 100;

    pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.run_history_capacity == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "scheduler.run_history_capacity".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_history_capacity: default_run_history_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_run_history_capacity() -> usize {
    SchedulerConfig::DEFAULT_RUN_HISTORY_CAPACITY
}

fn default_shutdown_timeout_ms() -> u64 {
    SchedulerConfig::DEFAULT_SHUTDOWN_TIMEOUT_MS
}
