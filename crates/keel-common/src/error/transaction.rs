//! Transaction core error types.

use std::fmt;
use thiserror::Error;

use crate::types::{ResourceId, Timestamp, TxnId, TxnPhase};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Invalid configuration or argument.
    InvalidArgument = 0x0003,
    /// The core is shutting down.
    ShuttingDown = 0x0006,

    // Transaction errors (0x0300 - 0x03FF)
    /// Transaction was aborted.
    TransactionAborted = 0x0300,
    /// Write-write conflict under snapshot isolation.
    WriteConflict = 0x0301,
    /// Deadlock detected.
    Deadlock = 0x0302,
    /// Lock wait exceeded the configured bound.
    LockTimeout = 0x0303,
    /// Transaction not found or not active.
    UnknownTransaction = 0x0304,
    /// Two-phase locking contract violated.
    InvalidPhaseTransition = 0x0306,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x03 => "Transaction",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The error type returned by every fallible operation of the core.
///
/// Errors are always returned to the immediate caller; the core never
/// retries on its own. Use [`KeelError::is_retryable`] to decide whether the
/// whole transaction may be re-run from `begin`.
///
/// # Example
///
/// ```rust
/// use keel_common::error::{KeelError, KeelResult};
/// use keel_common::types::TxnId;
///
/// fn lookup(txn_id: TxnId) -> KeelResult<()> {
///     Err(KeelError::UnknownTransaction { txn_id })
/// }
///
/// assert!(!lookup(TxnId::new(9)).unwrap_err().is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeelError {
    /// The transaction was chosen as a deadlock victim.
    #[error("deadlock detected, transaction {txn_id} was chosen as victim (cycle: {cycle:?})")]
    Deadlock {
        /// The victim.
        txn_id: TxnId,
        /// Members of the detected cycle.
        cycle: Vec<TxnId>,
    },

    /// First-committer-wins check failed at commit.
    #[error("write conflict for transaction {txn_id} on {resource}: committed at {committed_at}")]
    WriteConflict {
        /// The transaction that lost.
        txn_id: TxnId,
        /// The contended resource.
        resource: ResourceId,
        /// Commit timestamp of the newer version that won.
        committed_at: Timestamp,
    },

    /// A lock operation was issued in a phase that forbids it.
    #[error("transaction {txn_id} cannot {operation} in phase {phase}")]
    InvalidPhaseTransition {
        /// The offending transaction.
        txn_id: TxnId,
        /// Phase at the time of the call.
        phase: TxnPhase,
        /// The rejected operation.
        operation: &'static str,
    },

    /// A lock wait exceeded the configured bound.
    #[error("transaction {txn_id} timed out after {waited_ms}ms waiting for {resource}")]
    LockTimeout {
        /// The waiting transaction.
        txn_id: TxnId,
        /// The resource it was waiting for.
        resource: ResourceId,
        /// How long it waited.
        waited_ms: u64,
    },

    /// The transaction does not exist or is no longer active.
    #[error("unknown transaction {txn_id}")]
    UnknownTransaction {
        /// The missing transaction.
        txn_id: TxnId,
    },

    /// The transaction has been aborted.
    #[error("transaction {txn_id} was aborted")]
    TransactionAborted {
        /// The aborted transaction.
        txn_id: TxnId,
    },

    /// The core is shutting down and accepts no new transactions.
    #[error("transaction core is shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl KeelError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Deadlock { .. } => ErrorCode::Deadlock,
            Self::WriteConflict { .. } => ErrorCode::WriteConflict,
            Self::InvalidPhaseTransition { .. } => ErrorCode::InvalidPhaseTransition,
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::UnknownTransaction { .. } => ErrorCode::UnknownTransaction,
            Self::TransactionAborted { .. } => ErrorCode::TransactionAborted,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::InvalidConfig { .. } => ErrorCode::InvalidArgument,
        }
    }

    /// Returns true if re-running the whole transaction may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Deadlock { .. } | Self::WriteConflict { .. } | Self::LockTimeout { .. }
        )
    }

    /// Returns the transaction this error is about, if any.
    #[must_use]
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            Self::Deadlock { txn_id, .. }
            | Self::WriteConflict { txn_id, .. }
            | Self::InvalidPhaseTransition { txn_id, .. }
            | Self::LockTimeout { txn_id, .. }
            | Self::UnknownTransaction { txn_id }
            | Self::TransactionAborted { txn_id } => Some(*txn_id),
            Self::ShuttingDown | Self::InvalidConfig { .. } => None,
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
