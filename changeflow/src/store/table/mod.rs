mod base;

pub use base::{CommitReceipt, TableStore, TableTransaction};
