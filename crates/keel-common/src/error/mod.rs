//! Error handling for Keel.
//!
//! This module provides a unified error type and result alias used
//! across all Keel components.

mod transaction;

pub use transaction::{ErrorCode, KeelError};

/// Result type alias for Keel operations.
pub type KeelResult<T> = std::result::Result<T, KeelError>;
