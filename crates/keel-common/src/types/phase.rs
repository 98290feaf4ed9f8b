//! Two-phase locking states of a transaction.
//!
//! ```text
//! ┌─────────┐ first release ┌───────────┐
//! │ Growing │──────────────▶│ Shrinking │
//! └─────────┘               └───────────┘
//!      │                          │
//!      └────────┬─────────────────┘
//!        commit │ abort
//!               ▼
//!   ┌───────────┐  ┌─────────┐
//!   │ Committed │  │ Aborted │
//!   └───────────┘  └─────────┘
//! ```
//!
//! A transaction never returns to `Growing` once it has left it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnPhase {
    /// May acquire locks.
    Growing,
    /// Has released at least one lock; may only release.
    Shrinking,
    /// Committed; all locks released.
    Committed,
    /// Aborted; all locks released and pending writes discarded.
    Aborted,
}

impl TxnPhase {
    /// Returns true if the transaction has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, TxnPhase::Committed | TxnPhase::Aborted)
    }

    /// Returns true if the transaction may still issue operations.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, TxnPhase::Growing | TxnPhase::Shrinking)
    }

    /// Returns true if a move from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: TxnPhase) -> bool {
        matches!(
            (self, next),
            (TxnPhase::Growing, TxnPhase::Shrinking)
                | (TxnPhase::Growing, TxnPhase::Committed)
                | (TxnPhase::Growing, TxnPhase::Aborted)
                | (TxnPhase::Shrinking, TxnPhase::Committed)
                | (TxnPhase::Shrinking, TxnPhase::Aborted)
        )
    }
}

impl fmt::Display for TxnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnPhase::Growing => write!(f, "Growing"),
            TxnPhase::Shrinking => write!(f, "Shrinking"),
            TxnPhase::Committed => write!(f, "Committed"),
            TxnPhase::Aborted => write!(f, "Aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use TxnPhase::*;

        assert!(Growing.can_transition_to(Shrinking));
        assert!(Growing.can_transition_to(Committed));
        assert!(Shrinking.can_transition_to(Aborted));

        // Never back to growing.
        assert!(!Shrinking.can_transition_to(Growing));
        assert!(!Committed.can_transition_to(Growing));
        assert!(!Aborted.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Aborted));
    }

    #[test]
    fn test_phase_predicates() {
        assert!(TxnPhase::Growing.is_active());
        assert!(TxnPhase::Shrinking.is_active());
        assert!(TxnPhase::Committed.is_terminal());
        assert!(TxnPhase::Aborted.is_terminal());
        assert!(!TxnPhase::Aborted.is_active());
        assert_eq!(TxnPhase::Shrinking.to_string(), "Shrinking");
    }
}
