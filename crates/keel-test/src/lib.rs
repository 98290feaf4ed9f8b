//! # keel-test
//!
//! Integration tests for Keel.
//!
//! This crate contains:
//! - Test utilities (tracing setup, value encoding)
//! - Workload generators (bank transfers, retried transactions)
//! - Multi-threaded correctness tests under `tests/`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Test utilities and helpers
pub mod utils;

/// Workload generators
pub mod workload;
