//! Configuration types and loading for changeflow hosts.
//!
//! The [`shared`] module holds the serde types describing merge jobs, batching and the scheduler,
//! while [`load`] assembles them from layered configuration files and `APP_` environment overrides.

pub mod environment;
pub mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config, load_config_from};
