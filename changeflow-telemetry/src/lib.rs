//! Tracing setup shared by changeflow hosts and tests.

pub mod tracing;

pub use crate::tracing::{LogFlusher, TracingError, init_test_tracing, init_tracing};
