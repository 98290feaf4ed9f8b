//! # keel-txn
//!
//! Transaction concurrency control for Keel.
//!
//! This crate provides:
//!
//! - **Lock Management**: Multi-granularity locking with S, X, IS, IX and SIX
//!   modes, per-resource wait queues and in-place upgrades.
//!
//! - **Deadlock Detection**: An incremental wait-for graph search run each
//!   time a request blocks, with a pluggable victim policy.
//!
//! - **Two-Phase Locking**: Strict (default) or conventional 2PL, with
//!   intention locks taken on the enclosing table.
//!
//! - **Transaction Lifecycle**: Begin, read, write, commit and abort under
//!   snapshot isolation or serializable locking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    TransactionManager                    │
//! │                            │                             │
//! │       ┌────────────────────┼─────────────────────┐       │
//! │       ▼                    ▼                     ▼       │
//! │ ┌─────────────┐   ┌─────────────────┐   ┌─────────────┐  │
//! │ │  Timestamp  │   │  VersionStore   │   │ TwoPhase    │  │
//! │ │   Oracle    │   │ SnapshotRegistry│   │  Locking    │  │
//! │ └─────────────┘   │ GarbageCollector│   └──────┬──────┘  │
//! │                   └─────────────────┘          ▼         │
//! │                                         ┌─────────────┐  │
//! │                                         │ LockManager │  │
//! │                                         │  Deadlock   │  │
//! │                                         │  Detector   │  │
//! │                                         └─────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use bytes::Bytes;
//! use keel_common::types::ResourceId;
//! use keel_txn::TransactionManager;
//!
//! let tm = TransactionManager::new();
//! let row = ResourceId::row(1, "alice");
//!
//! let txn = tm.begin().unwrap();
//! tm.write(txn, row.clone(), Bytes::from("100")).unwrap();
//! assert_eq!(tm.read(txn, &row).unwrap(), Some(Bytes::from("100")));
//! tm.commit(txn).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Transaction lifecycle management.
///
/// This module provides:
/// - [`manager::TransactionManager`]: Main coordinator for transactions
/// - [`manager::TransactionInfo`]: Snapshot of an active transaction
pub mod manager;

/// Lock table implementation.
///
/// This module provides:
/// - [`lock::LockManager`]: Manages all locks
/// - [`lock::LockMode`]: Shared, Exclusive, and intention locks
/// - [`lock::LockTable`]: Per-resource lock state
pub mod lock;

/// Deadlock detection.
///
/// This module provides:
/// - [`deadlock::WaitForGraph`]: Tracks transaction dependencies
/// - [`deadlock::DeadlockDetector`]: Detects deadlocks and picks victims
/// - [`deadlock::VictimSelector`]: Victim policy interface
pub mod deadlock;

/// Two-phase locking discipline.
pub mod twopl;

// Re-export commonly used types

pub use manager::{TransactionInfo, TransactionManager, TransactionStats};

pub use lock::{LockManager, LockMode, LockRequest, LockResult, LockStats};

pub use deadlock::{
    CycleMember, DeadlockDetector, DeadlockInfo, DeadlockStats, FewestLocksYoungest,
    VictimSelector, WaitForGraph,
};

pub use twopl::TwoPhaseLocking;
