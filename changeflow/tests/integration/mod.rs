#![cfg(feature = "test-utils")]

mod concurrency_test;
mod pipeline_test;
mod scheduler_test;
mod view_test;
