//! Coordination primitives shared by the scheduler and its job workers.
//!
//! [`shutdown`] broadcasts a single stop request to every job worker. Workers finish the merge cycle
//! they are running, so a shutdown never interrupts a target transaction halfway.

pub mod shutdown;
