//! Common types used throughout the engine.
//!
//! Identifiers, cell values, rows and the change entries recorded for every mutation.

mod change;
mod ids;
mod row;
mod value;

pub use change::*;
pub use ids::*;
pub use row::*;
pub use value::*;
