//! Shared configuration types for changeflow jobs.

mod base;
mod batch;
mod changeflow;
mod job;
mod scheduler;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use changeflow::ChangeflowConfig;
pub use job::{ConsumerModeConfig, JobConfig};
pub use scheduler::SchedulerConfig;
