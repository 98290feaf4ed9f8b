//! Keel Performance Benchmarks
//!
//! This crate contains benchmarks for the Keel transaction core:
//! - Lock manager acquisition, release and contention
//! - Version store snapshot reads and commit publication
//! - End-to-end transactions under both isolation levels
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p keel-bench
//! ```

pub mod utils;
