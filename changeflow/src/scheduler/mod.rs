//! Scheduled execution of merge jobs.
//!
//! - [`schedule`] and [`cron`] parse job schedules and compute their next due time.
//! - [`registry`] holds jobs, their lifecycle and their run history.
//! - [`Scheduler`] spawns one worker per job and exposes the job operations.

pub mod core;
pub mod cron;
pub mod registry;
pub mod schedule;
pub mod timer;

pub use self::core::Scheduler;
pub use registry::{
    JobDefinition, JobRegistry, JobRun, JobState, JobStatus, RunOutcome, RunTrigger, SkipReason,
};
pub use schedule::Schedule;
