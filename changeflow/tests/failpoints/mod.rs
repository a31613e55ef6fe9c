#![cfg(all(feature = "failpoints", feature = "test-utils"))]
