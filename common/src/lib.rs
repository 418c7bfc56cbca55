//! Configuration and test utilities shared by the `fulfillment` and
//! `market` crates.

pub mod config;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
