//! # keel-mvcc
//!
//! Multi-version concurrency control for Keel.
//!
//! This crate implements:
//! - A single timestamp oracle for snapshots and commits
//! - Version chain management with first-committer-wins validation
//! - Snapshot visibility and the active snapshot registry
//! - Horizon-based garbage collection

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Timestamp oracle
pub mod clock;

/// Version chain storage
pub mod version;

/// Horizon-based garbage collection
pub mod gc;

/// Snapshot isolation
pub mod snapshot;

pub use clock::{CommitWindow, TimestampOracle};
pub use gc::{GarbageCollector, GcResult, GcStats, GcWorker};
pub use snapshot::{Snapshot, SnapshotRegistry};
pub use version::{Version, VersionChain, VersionStore, WriteSet};
