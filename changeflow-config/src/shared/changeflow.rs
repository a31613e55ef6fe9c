use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::load::Config;
use crate::shared::{BatchConfig, JobConfig, SchedulerConfig, ValidationError};

/// Top-level configuration of a changeflow host.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChangeflowConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl ChangeflowConfig {
    /// Validates every section and the relationships between jobs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;
        self.scheduler.validate()?;

        let mut names = HashMap::new();
        let mut consumers: HashMap<&str, &str> = HashMap::new();
        for job in &self.jobs {
            job.validate()?;

            if names.insert(job.name.as_str(), ()).is_some() {
                return Err(ValidationError::DuplicateJobName(job.name.clone()));
            }

            if let Some(first) = consumers.insert(job.consumer.as_str(), job.name.as_str()) {
                return Err(ValidationError::SharedConsumer {
                    consumer: job.consumer.clone(),
                    first: first.to_string(),
                    second: job.name.clone(),
                });
            }
        }

        Ok(())
    }
}

impl Config for ChangeflowConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
