//! Type definitions for Keel.
//!
//! This module contains the core types shared by the lock manager, the
//! version store and the transaction manager.

mod ids;
mod phase;
mod resource;
mod timestamps;

pub use ids::{TxnId, VersionId};
pub use phase::TxnPhase;
pub use resource::{ResourceId, Value};
pub use timestamps::Timestamp;
