pub mod job;
pub mod merge;
pub mod pool;
