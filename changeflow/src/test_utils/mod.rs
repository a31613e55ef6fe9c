//! Helpers for testing the engine and code built on top of it.
//!
//! - [`table`] wraps a table store to inject write and commit failures or slow commits.
//! - [`rows`] builds the member rows and mutations used across tests.
//! - [`runs`] waits for job runs to be recorded in a [`crate::scheduler::JobRegistry`].
//!
//! Enabled with the `test-utils` feature.

pub mod rows;
pub mod runs;
pub mod table;
