//! # keel-common
//!
//! Common types, errors, and configuration for the Keel transaction core.
//!
//! This crate provides the foundational types shared by the lock manager,
//! the multi-version store and the transaction manager:
//!
//! - **Types**: identifiers (`TxnId`, `VersionId`), logical `Timestamp`s,
//!   lockable `ResourceId`s and the two-phase locking `TxnPhase`
//! - **Errors**: unified error handling with `KeelError`
//! - **Config**: `CoreConfig` and its component sections
//! - **Constants**: bootstrap identifiers
//!
//! ## Example
//!
//! ```rust
//! use keel_common::types::{ResourceId, TxnId};
//! use keel_common::error::{KeelError, KeelResult};
//!
//! fn example() -> KeelResult<()> {
//!     let txn = TxnId::new(1);
//!     let row = ResourceId::row(1, "alice");
//!     assert_eq!(row.parent(), Some(ResourceId::table(1)));
//!     Err(KeelError::UnknownTransaction { txn_id: txn })
//! }
//!
//! assert!(example().is_err());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use error::{ErrorCode, KeelError, KeelResult};
pub use types::{ResourceId, Timestamp, TxnId, TxnPhase, Value, VersionId};
