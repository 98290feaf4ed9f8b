//! Two-phase locking coordinator.
//!
//! Sits between the transaction manager and the [`LockManager`] and enforces
//! the phase discipline of every transaction:
//!
//! ```text
//!  Growing ──first release──▶ Shrinking ──commit/abort──▶ Committed | Aborted
//! ```
//!
//! Under [`LockingProtocol::Strict`] no lock is released before the
//! transaction ends, so a caller never observes `Shrinking`. Under
//! [`LockingProtocol::Conventional`] the first release moves the transaction
//! to `Shrinking`, after which any acquisition fails with
//! `InvalidPhaseTransition`.
//!
//! With hierarchical locking enabled, every row or page lock is preceded by
//! the matching intention lock on its table.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use keel_common::config::LockingProtocol;
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{ResourceId, TxnId, TxnPhase};
use tracing::debug;

use crate::lock::{LockManager, LockMode};

/// Enforces growing/shrinking phases on top of the lock manager.
pub struct TwoPhaseLocking {
    locks: Arc<LockManager>,
    phases: DashMap<TxnId, TxnPhase>,
    protocol: LockingProtocol,
    hierarchical: bool,
}

impl TwoPhaseLocking {
    /// Creates a coordinator over `locks`.
    pub fn new(locks: Arc<LockManager>, protocol: LockingProtocol, hierarchical: bool) -> Self {
        Self {
            locks,
            phases: DashMap::new(),
            protocol,
            hierarchical,
        }
    }

    /// Starts tracking `txn_id` in the growing phase.
    pub fn begin(&self, txn_id: TxnId) {
        self.locks.register(txn_id);
        self.phases.insert(txn_id, TxnPhase::Growing);
    }

    /// Acquires `mode` on `resource`, blocking while it is held incompatibly.
    ///
    /// Fails with `InvalidPhaseTransition` once the transaction is shrinking.
    pub fn acquire(&self, txn_id: TxnId, resource: &ResourceId, mode: LockMode) -> KeelResult<()> {
        match self.phase(txn_id) {
            Some(TxnPhase::Growing) => {}
            Some(phase @ TxnPhase::Shrinking) => {
                return Err(KeelError::InvalidPhaseTransition {
                    txn_id,
                    phase,
                    operation: "acquire a lock",
                });
            }
            Some(_) | None => return Err(KeelError::UnknownTransaction { txn_id }),
        }

        if self.hierarchical {
            if let Some(parent) = resource.parent() {
                self.locks.acquire(txn_id, &parent, mode.intention())?;
            }
        }
        self.locks.acquire(txn_id, resource, mode)
    }

    /// Releases one lock before the transaction ends.
    ///
    /// Only permitted under the conventional protocol; the first release
    /// moves the transaction to `Shrinking`. Returns false if the lock was
    /// not held.
    pub fn release(&self, txn_id: TxnId, resource: &ResourceId) -> KeelResult<bool> {
        {
            let mut phase = self
                .phases
                .get_mut(&txn_id)
                .ok_or(KeelError::UnknownTransaction { txn_id })?;
            if !phase.is_active() {
                return Err(KeelError::UnknownTransaction { txn_id });
            }
            if self.protocol == LockingProtocol::Strict {
                return Err(KeelError::InvalidPhaseTransition {
                    txn_id,
                    phase: *phase,
                    operation: "release a lock before commit",
                });
            }
            if *phase == TxnPhase::Growing {
                debug!(txn = %txn_id, "entering shrinking phase");
                *phase = TxnPhase::Shrinking;
            }
        }
        Ok(self.locks.release(txn_id, resource))
    }

    /// Ends the transaction: cancels any pending wait and releases every
    /// lock it holds. Returns the number of locks released.
    pub fn finish(&self, txn_id: TxnId, outcome: TxnPhase) -> usize {
        debug_assert!(outcome.is_terminal());
        self.phases.remove(&txn_id);
        let released = self.locks.close(txn_id);
        debug!(txn = %txn_id, outcome = %outcome, released, "locks released");
        released
    }

    /// Returns the phase of a tracked transaction.
    pub fn phase(&self, txn_id: TxnId) -> Option<TxnPhase> {
        self.phases.get(&txn_id).map(|phase| *phase)
    }

    /// Returns the number of tracked transactions.
    pub fn active_count(&self) -> usize {
        self.phases.len()
    }

    /// Returns the underlying lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Returns the locking protocol.
    pub fn protocol(&self) -> LockingProtocol {
        self.protocol
    }

    /// Returns true if intention locks are taken on parent resources.
    pub fn is_hierarchical(&self) -> bool {
        self.hierarchical
    }
}

impl fmt::Debug for TwoPhaseLocking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoPhaseLocking")
            .field("protocol", &self.protocol)
            .field("hierarchical", &self.hierarchical)
            .field("active", &self.active_count())
            .finish()
    }
}
