mod base;

pub use base::ChangeLogStore;
