//! Change capture and merge engine.
//!
//! Writes to tracked tables go through the [`changelog::ChangeLog`], which records one change entry
//! per row effect in the same transaction. Consumers read those entries through the
//! [`view::ChangeView`] and the [`apply::MergeApplier`] replays them onto target tables. The
//! [`scheduler::Scheduler`] runs merge jobs on their schedules and [`pipeline::Pipeline`] wires
//! everything together from configuration.

pub mod apply;
pub mod changelog;
pub mod concurrency;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
mod macros;
pub mod pipeline;
pub mod scheduler;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod view;
pub mod workers;
