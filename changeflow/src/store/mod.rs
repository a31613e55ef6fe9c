//! Storage interfaces consumed by the engine and their in-process implementations.
//!
//! - [`table`] defines the transactional table store the change log and the merge applier write to.
//! - [`log`] defines the read side of the change log kept next to every tracked table.
//! - [`cursor`] defines the per-consumer offsets of the change view.
//! - [`both`] holds [`both::memory::MemoryStore`], which implements the table and log traits together
//!   so that row writes and their change entries commit under one lock.

pub mod both;
pub mod cursor;
pub mod log;
pub mod table;
