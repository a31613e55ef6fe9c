use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Which change entries a consumer gets to see.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerModeConfig {
    /// Inserts, deletes and update pairs.
    #[default]
    Standard,
    /// Plain inserts only; deletes and update pairs are skipped.
    AppendOnly,
}

/// A scheduled merge of one consumer's changes into a target table.
///
/// The schedule is kept as written here and parsed once when the job is registered, so an
/// invalid expression is rejected at setup rather than on a tick.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobConfig {
    /// Unique name of the job.
    pub name: String,
    /// Consumer whose cursor tracks the job's progress through the change log.
    pub consumer: String,
    /// Table whose change log is consumed.
    pub source_table: String,
    /// Table the changes are merged into.
    pub target_table: String,
    /// Schedule expression, e.g. `"5 minutes"`, `"USING CRON 0 * * * * UTC"` or `"AT 02:30"`.
    pub schedule: String,
    /// When set, ticks with no pending changes are skipped without running the merge.
    #[serde(default = "default_when_has_data")]
    pub when_has_data: bool,
    /// Upper bound, in milliseconds, on a single merge cycle.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub mode: ConsumerModeConfig,
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("name", &self.name),
            ("consumer", &self.consumer),
            ("source_table", &self.source_table),
            ("target_table", &self.target_table),
            ("schedule", &self.schedule),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::InvalidFieldValue {
                    field: format!("jobs.{}.{field}", self.name),
                    constraint: "must not be empty".to_string(),
                });
            }
        }

        if self.source_table == self.target_table {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("jobs.{}.target_table", self.name),
                constraint: "must differ from `source_table`".to_string(),
            });
        }

        if self.timeout_ms == Some(0) {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("jobs.{}.timeout_ms", self.name),
                constraint: "must be greater than 0 when set".to_string(),
            });
        }

        Ok(())
    }
}

fn default_when_has_data() -> bool {
    true
}
