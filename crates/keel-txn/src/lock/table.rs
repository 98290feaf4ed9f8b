//! The lock table: per-resource lock state and its mutation primitives.
//!
//! Each resource maps to a [`LockSlot`] holding its own mutex and condition
//! variable, so unrelated resources never contend. A slot is created on the
//! first request and retired once it has neither holders nor waiters. A
//! caller that reaches a retired slot simply looks the resource up again.
//!
//! The table carries no policy. Compatibility decisions and grant order live
//! in [`LockManager`](super::LockManager).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use keel_common::types::{ResourceId, TxnId};
use parking_lot::{Condvar, Mutex};

use super::LockMode;

/// A queued lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// Transaction requesting the lock.
    pub txn_id: TxnId,
    /// Mode it will hold once granted.
    pub mode: LockMode,
    /// True if the transaction already holds a weaker mode.
    pub upgrade: bool,
}

/// Lock state of one resource.
#[derive(Debug, Default)]
pub struct LockEntry {
    /// Granted modes by holder.
    granted: HashMap<TxnId, LockMode>,
    /// Waiting requests in grant order.
    queue: VecDeque<LockRequest>,
    /// Set once the slot has been removed from the table.
    retired: bool,
}

impl LockEntry {
    /// Returns the mode `txn_id` holds, if any.
    pub fn granted_mode(&self, txn_id: TxnId) -> Option<LockMode> {
        self.granted.get(&txn_id).copied()
    }

    /// Checks `mode` against every holder other than `txn_id`.
    pub fn compatible_with_holders(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.granted
            .iter()
            .all(|(holder, held)| *holder == txn_id || held.is_compatible_with(&mode))
    }

    /// Holders other than `txn_id` whose mode conflicts with `mode`.
    pub fn conflicting_holders(&self, txn_id: TxnId, mode: LockMode) -> impl Iterator<Item = TxnId> + '_ {
        self.granted
            .iter()
            .filter(move |(holder, held)| **holder != txn_id && !held.is_compatible_with(&mode))
            .map(|(holder, _)| *holder)
    }

    /// Transactions queued ahead of position `index`.
    ///
    /// Under FIFO grants a waiter cannot be granted before every request
    /// ahead of it has left the queue, so it waits for all of them.
    pub fn predecessors(&self, index: usize) -> impl Iterator<Item = TxnId> + '_ {
        let txn_id = self.queue.get(index).map(|r| r.txn_id);
        self.queue
            .iter()
            .take(index)
            .map(|earlier| earlier.txn_id)
            .filter(move |earlier| Some(*earlier) != txn_id)
    }

    /// Records a grant, replacing any weaker mode already held.
    pub fn grant(&mut self, txn_id: TxnId, mode: LockMode) {
        self.granted.insert(txn_id, mode);
    }

    /// Removes a holder and returns the mode it held.
    pub fn remove_holder(&mut self, txn_id: TxnId) -> Option<LockMode> {
        self.granted.remove(&txn_id)
    }

    /// Appends a request at the tail of the queue.
    pub fn enqueue(&mut self, request: LockRequest) {
        self.queue.push_back(request);
    }

    /// Queues an upgrade behind earlier upgrades but ahead of every other
    /// waiter.
    pub fn enqueue_upgrade(&mut self, request: LockRequest) {
        let position = self
            .queue
            .iter()
            .position(|r| !r.upgrade)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, request);
    }

    /// Returns true if an upgrade is waiting.
    pub fn has_queued_upgrade(&self) -> bool {
        self.queue.front().is_some_and(|r| r.upgrade)
    }

    /// Removes the queued request of `txn_id`.
    pub fn remove_request(&mut self, txn_id: TxnId) -> Option<LockRequest> {
        let index = self.queue.iter().position(|r| r.txn_id == txn_id)?;
        self.queue.remove(index)
    }

    /// Returns the queued request at `index`.
    pub fn request_at(&self, index: usize) -> Option<LockRequest> {
        self.queue.get(index).copied()
    }

    /// Removes and returns the queued request at `index`.
    pub fn take_request(&mut self, index: usize) -> Option<LockRequest> {
        self.queue.remove(index)
    }

    /// Returns the number of queued requests.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no request is waiting.
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the holders, ordered by transaction ID.
    pub fn holders(&self) -> Vec<(TxnId, LockMode)> {
        let mut holders: Vec<_> = self.granted.iter().map(|(t, m)| (*t, *m)).collect();
        holders.sort_by_key(|(t, _)| *t);
        holders
    }

    /// Returns the waiters in queue order.
    pub fn waiters(&self) -> Vec<LockRequest> {
        self.queue.iter().copied().collect()
    }

    /// True if the entry has neither holders nor waiters.
    pub fn is_idle(&self) -> bool {
        self.granted.is_empty() && self.queue.is_empty()
    }

    /// True once the slot holding this entry has left the table.
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

/// A lock entry with the condition variable its waiters park on.
#[derive(Debug, Default)]
pub struct LockSlot {
    /// The guarded entry.
    pub entry: Mutex<LockEntry>,
    /// Signalled whenever a queued request is granted or rejected.
    pub changed: Condvar,
}

/// Resource-keyed table of lock slots.
#[derive(Default)]
pub struct LockTable {
    slots: DashMap<ResourceId, Arc<LockSlot>>,
}

impl LockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `resource`, creating it if needed.
    pub fn slot(&self, resource: &ResourceId) -> Arc<LockSlot> {
        if let Some(slot) = self.slots.get(resource) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(resource.clone())
                .or_insert_with(|| Arc::new(LockSlot::default()))
                .value(),
        )
    }

    /// Returns the slot for `resource` if one exists.
    pub fn get(&self, resource: &ResourceId) -> Option<Arc<LockSlot>> {
        self.slots.get(resource).map(|slot| Arc::clone(slot.value()))
    }

    /// Removes `slot` from the table if it is idle. Must be called without
    /// holding the slot's mutex.
    pub fn retire_if_idle(&self, resource: &ResourceId, slot: &Arc<LockSlot>) -> bool {
        self.slots
            .remove_if(resource, |_, current| {
                if !Arc::ptr_eq(current, slot) {
                    return false;
                }
                let mut entry = current.entry.lock();
                if entry.is_idle() {
                    entry.retired = true;
                    true
                } else {
                    false
                }
            })
            .is_some()
    }

    /// Returns the number of resources with lock state.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no resource is locked or awaited.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("len", &self.len())
            .finish()
    }
}
