//! System-wide constants for Keel.

use crate::types::{Timestamp, TxnId};

/// Creator recorded on versions installed by `preload`.
pub const BOOTSTRAP_TXN_ID: TxnId = TxnId::INVALID;

/// Valid-from timestamp of preloaded versions.
pub const BOOTSTRAP_TIMESTAMP: Timestamp = Timestamp::ZERO;

/// First transaction ID handed out by a transaction manager.
pub const FIRST_TXN_ID: u64 = 1;

/// First timestamp handed out by the timestamp oracle.
pub const FIRST_TIMESTAMP: u64 = 1;
