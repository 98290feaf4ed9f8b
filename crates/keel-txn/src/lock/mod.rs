//! Lock management for transaction isolation.
//!
//! This module implements a multi-granularity lock manager supporting:
//! - Shared (S) and exclusive (X) locks on tables, pages and rows
//! - Intention locks (IS, IX, SIX) for hierarchical locking
//! - In-place upgrades, queued ahead of ordinary waiters
//! - FIFO or greedy wait queues with blocking waits
//! - Deadlock resolution through the wait-for graph, or bounded waits
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ IS │ IX │ S  │ SIX │ X  │
//! ─────────┼────┼────┼────┼─────┼────┤
//!     IS   │ ✓  │ ✓  │ ✓  │  ✓  │ ✗  │
//!     IX   │ ✓  │ ✓  │ ✗  │  ✗  │ ✗  │
//!     S    │ ✓  │ ✗  │ ✓  │  ✗  │ ✗  │
//!     SIX  │ ✓  │ ✗  │ ✗  │  ✗  │ ✗  │
//!     X    │ ✗  │ ✗  │ ✗  │  ✗  │ ✗  │
//! ```
//!
//! # Guard Ordering
//!
//! A resource guard is always taken before the per-transaction state, and
//! both before the wait-for graph. Cycle detection runs with no guard held.
//! No operation holds two resource guards at once.

mod table;

pub use table::{LockEntry, LockRequest, LockSlot, LockTable};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use dashmap::DashMap;
use keel_common::config::{DeadlockMode, LockConfig, QueueFairness};
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{ResourceId, TxnId};
use tracing::{debug, warn};

use crate::deadlock::DeadlockDetector;

/// Lock mode for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock (read lock).
    Shared,
    /// Exclusive lock (write lock).
    Exclusive,
    /// Intention shared (table-level hint for row S locks).
    IntentionShared,
    /// Intention exclusive (table-level hint for row X locks).
    IntentionExclusive,
    /// Shared plus intention exclusive: reads the whole table, writes some rows.
    SharedIntentionExclusive,
}

impl LockMode {
    /// Every mode, weakest first.
    pub const ALL: [LockMode; 5] = [
        LockMode::IntentionShared,
        LockMode::IntentionExclusive,
        LockMode::Shared,
        LockMode::SharedIntentionExclusive,
        LockMode::Exclusive,
    ];

    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentionShared, IntentionShared)
                | (IntentionShared, IntentionExclusive)
                | (IntentionShared, Shared)
                | (IntentionShared, SharedIntentionExclusive)
                | (IntentionExclusive, IntentionShared)
                | (IntentionExclusive, IntentionExclusive)
                | (Shared, IntentionShared)
                | (Shared, Shared)
                | (SharedIntentionExclusive, IntentionShared)
        )
    }

    /// Returns true if holding `self` already grants everything `other` does.
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            SharedIntentionExclusive => other != Exclusive,
            Shared => matches!(other, Shared | IntentionShared),
            IntentionExclusive => matches!(other, IntentionExclusive | IntentionShared),
            IntentionShared => other == IntentionShared,
        }
    }

    /// Returns the weakest mode covering both `self` and `other`.
    pub fn combine(self, other: LockMode) -> LockMode {
        use LockMode::*;
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else if matches!(
            (self, other),
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared)
        ) {
            SharedIntentionExclusive
        } else {
            Exclusive
        }
    }

    /// Returns the intention mode to take on the parent resource.
    pub fn intention(self) -> LockMode {
        match self {
            LockMode::Shared | LockMode::IntentionShared => LockMode::IntentionShared,
            _ => LockMode::IntentionExclusive,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
            LockMode::IntentionShared => write!(f, "IS"),
            LockMode::IntentionExclusive => write!(f, "IX"),
            LockMode::SharedIntentionExclusive => write!(f, "SIX"),
        }
    }
}

/// Result of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    /// The lock is held.
    Granted,
    /// The request is queued; call [`LockManager::wait`] to block on it.
    Blocked,
    /// Queueing the request closed a cycle and this transaction was chosen
    /// as the victim. The request has been withdrawn.
    Deadlock {
        /// Members of the cycle, starting with the requester.
        cycle: Vec<TxnId>,
    },
}

impl LockResult {
    /// Returns true if the lock was acquired.
    pub fn is_granted(&self) -> bool {
        matches!(self, LockResult::Granted)
    }
}

/// Statistics about the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock acquisitions.
    pub acquisitions: AtomicU64,
    /// Total lock releases.
    pub releases: AtomicU64,
    /// Total lock waits.
    pub waits: AtomicU64,
    /// Total deadlocks resolved.
    pub deadlocks: AtomicU64,
    /// Total lock upgrades.
    pub upgrades: AtomicU64,
    /// Total timeouts.
    pub timeouts: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful acquisition.
    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a release.
    pub fn record_release(&self) {
        self.releases.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a wait.
    pub fn record_wait(&self) {
        self.waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a deadlock.
    pub fn record_deadlock(&self) {
        self.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records an upgrade.
    pub fn record_upgrade(&self) {
        self.upgrades.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Why a queued request was removed without being granted.
#[derive(Debug, Clone)]
enum Rejection {
    Deadlock(Vec<TxnId>),
    Aborted,
}

impl Rejection {
    fn into_error(self, txn_id: TxnId) -> KeelError {
        match self {
            Rejection::Deadlock(cycle) => KeelError::Deadlock { txn_id, cycle },
            Rejection::Aborted => KeelError::TransactionAborted { txn_id },
        }
    }
}

/// Lock bookkeeping of one registered transaction.
#[derive(Debug, Default)]
struct TxnLocks {
    held: HashMap<ResourceId, LockMode>,
    waiting: Option<(ResourceId, LockMode)>,
    rejection: Option<Rejection>,
    closed: bool,
}

impl TxnLocks {
    fn waits_on(&self, resource: &ResourceId) -> bool {
        matches!(&self.waiting, Some((r, _)) if r == resource)
    }
}

enum WaitState {
    Queued,
    Granted,
    Rejected(Rejection),
}

/// The lock manager for managing transaction locks.
///
/// Transactions must be [registered](LockManager::register) before they
/// request locks and [closed](LockManager::close) when they end. Closing
/// cancels a pending wait and releases everything the transaction holds.
pub struct LockManager {
    /// Per-resource lock state.
    table: LockTable,
    /// Locks held and awaited by each registered transaction.
    txns: DashMap<TxnId, TxnLocks>,
    /// Wait-for graph and victim policy.
    detector: DeadlockDetector,
    /// Configuration.
    config: LockConfig,
    /// Statistics.
    stats: LockStats,
}

impl LockManager {
    /// Creates a new lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    /// Creates a lock manager with custom configuration.
    pub fn with_config(config: LockConfig) -> Self {
        Self::with_detector(config, DeadlockDetector::new())
    }

    /// Creates a lock manager with a custom deadlock detector, typically
    /// one carrying a different victim policy.
    pub fn with_detector(config: LockConfig, detector: DeadlockDetector) -> Self {
        Self {
            table: LockTable::new(),
            txns: DashMap::new(),
            detector,
            config,
            stats: LockStats::new(),
        }
    }

    /// Registers a transaction. Registering twice is a no-op.
    pub fn register(&self, txn_id: TxnId) {
        self.txns.entry(txn_id).or_default();
    }

    /// Returns true if the transaction is registered and not closed.
    pub fn is_registered(&self, txn_id: TxnId) -> bool {
        self.txns.get(&txn_id).is_some_and(|txn| !txn.closed)
    }

    /// Requests a lock without blocking.
    ///
    /// Returns `Granted` if the lock is now held, `Blocked` if the request
    /// was queued, and `Deadlock` if queueing it closed a cycle in which the
    /// requester was chosen as victim.
    pub fn request(
        &self,
        txn_id: TxnId,
        resource: &ResourceId,
        mode: LockMode,
    ) -> KeelResult<LockResult> {
        let (result, grown) = self.submit(txn_id, resource, mode, true)?;

        if result == LockResult::Blocked {
            if let Some(cycle) = self.resolve_deadlocks(txn_id, true) {
                self.withdraw(txn_id, resource);
                self.stats.record_deadlock();
                self.resolve_grown(&grown, txn_id);
                return Ok(LockResult::Deadlock { cycle });
            }
        }
        self.resolve_grown(&grown, txn_id);

        // Resolving a cycle elsewhere may already have granted the request.
        if result == LockResult::Blocked
            && !self.is_waiting(txn_id)
            && self
                .held_mode(txn_id, resource)
                .is_some_and(|held| held.covers(mode))
        {
            return Ok(LockResult::Granted);
        }
        Ok(result)
    }

    /// Grants the lock if that is possible immediately; never queues.
    pub fn try_acquire(
        &self,
        txn_id: TxnId,
        resource: &ResourceId,
        mode: LockMode,
    ) -> KeelResult<LockResult> {
        let (result, grown) = self.submit(txn_id, resource, mode, false)?;
        self.resolve_grown(&grown, txn_id);
        Ok(result)
    }

    /// Acquires a lock, blocking until it is granted or the wait fails.
    pub fn acquire(&self, txn_id: TxnId, resource: &ResourceId, mode: LockMode) -> KeelResult<()> {
        match self.request(txn_id, resource, mode)? {
            LockResult::Granted => Ok(()),
            LockResult::Blocked => self.wait(txn_id, resource),
            LockResult::Deadlock { cycle } => Err(KeelError::Deadlock { txn_id, cycle }),
        }
    }

    /// Blocks until the queued request of `txn_id` on `resource` is granted.
    ///
    /// Fails with `Deadlock` if the transaction is chosen as a victim while
    /// waiting, `TransactionAborted` if it is closed, and `LockTimeout` if
    /// the configured bound elapses in timeout mode.
    pub fn wait(&self, txn_id: TxnId, resource: &ResourceId) -> KeelResult<()> {
        let started = Instant::now();
        let deadline = self.config.wait_bound().map(|bound| started + bound);

        let slot = self.table.slot(resource);
        let mut entry = slot.entry.lock();
        loop {
            match self.wait_state(txn_id, resource) {
                WaitState::Queued => {}
                WaitState::Granted => {
                    drop(entry);
                    self.table.retire_if_idle(resource, &slot);
                    return Ok(());
                }
                WaitState::Rejected(rejection) => {
                    drop(entry);
                    self.table.retire_if_idle(resource, &slot);
                    return Err(rejection.into_error(txn_id));
                }
            }

            let Some(deadline) = deadline else {
                slot.changed.wait(&mut entry);
                continue;
            };
            if !slot.changed.wait_until(&mut entry, deadline).timed_out() {
                continue;
            }
            let still_queued = self
                .txns
                .get(&txn_id)
                .is_some_and(|txn| txn.waits_on(resource));
            if !still_queued {
                continue;
            }

            entry.remove_request(txn_id);
            if let Some(mut txn) = self.txns.get_mut(&txn_id) {
                txn.waiting = None;
            }
            let grown = self.after_change(resource, &mut entry, &slot, &[txn_id]);
            drop(entry);
            self.table.retire_if_idle(resource, &slot);
            self.resolve_grown(&grown, txn_id);

            let waited_ms = started.elapsed().as_millis() as u64;
            self.stats.record_timeout();
            warn!(txn = %txn_id, resource = %resource, waited_ms, "lock wait timed out");
            return Err(KeelError::LockTimeout {
                txn_id,
                resource: resource.clone(),
                waited_ms,
            });
        }
    }

    /// Releases the lock `txn_id` holds on `resource`.
    ///
    /// Returns false if no lock was held. Waiters that become compatible are
    /// granted in queue order.
    pub fn release(&self, txn_id: TxnId, resource: &ResourceId) -> bool {
        let Some(slot) = self.table.get(resource) else {
            return false;
        };
        let grown = {
            let mut entry = slot.entry.lock();
            if entry.remove_holder(txn_id).is_none() {
                return false;
            }
            if let Some(mut txn) = self.txns.get_mut(&txn_id) {
                txn.held.remove(resource);
            }
            self.stats.record_release();
            self.after_change(resource, &mut entry, &slot, &[])
        };
        self.table.retire_if_idle(resource, &slot);
        self.resolve_grown(&grown, TxnId::INVALID);
        true
    }

    /// Releases every lock `txn_id` holds and returns how many there were.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let held: Vec<ResourceId> = match self.txns.get(&txn_id) {
            Some(txn) => txn.held.keys().cloned().collect(),
            None => return 0,
        };
        held.iter()
            .filter(|resource| self.release(txn_id, resource))
            .count()
    }

    /// Ends a transaction: cancels its pending wait, releases its locks and
    /// forgets it. Returns the number of locks released.
    pub fn close(&self, txn_id: TxnId) -> usize {
        let was_waiting = match self.txns.get_mut(&txn_id) {
            Some(mut txn) => {
                txn.closed = true;
                txn.waiting.is_some()
            }
            None => return 0,
        };
        if was_waiting {
            self.reject_waiter(txn_id, Rejection::Aborted);
        }

        let released = self.release_all(txn_id);
        self.txns.remove(&txn_id);
        if self.graph_enabled() {
            self.detector.graph().remove_txn(txn_id);
        }
        debug!(txn = %txn_id, released, "lock owner closed");
        released
    }

    /// Returns the holders of `resource`, ordered by transaction ID.
    pub fn holders(&self, resource: &ResourceId) -> Vec<(TxnId, LockMode)> {
        self.table
            .get(resource)
            .map(|slot| slot.entry.lock().holders())
            .unwrap_or_default()
    }

    /// Returns the queued requests on `resource` in grant order.
    pub fn waiters(&self, resource: &ResourceId) -> Vec<LockRequest> {
        self.table
            .get(resource)
            .map(|slot| slot.entry.lock().waiters())
            .unwrap_or_default()
    }

    /// Returns the mode `txn_id` holds on `resource`.
    pub fn held_mode(&self, txn_id: TxnId, resource: &ResourceId) -> Option<LockMode> {
        self.txns.get(&txn_id)?.held.get(resource).copied()
    }

    /// Returns every lock `txn_id` holds, ordered by resource.
    pub fn held_locks(&self, txn_id: TxnId) -> Vec<(ResourceId, LockMode)> {
        let mut held: Vec<_> = self
            .txns
            .get(&txn_id)
            .map(|txn| txn.held.iter().map(|(r, m)| (r.clone(), *m)).collect())
            .unwrap_or_default();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }

    /// Returns the number of locks `txn_id` holds.
    pub fn locks_held(&self, txn_id: TxnId) -> usize {
        self.txns.get(&txn_id).map_or(0, |txn| txn.held.len())
    }

    /// Returns true if `txn_id` has a queued request.
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.txns
            .get(&txn_id)
            .is_some_and(|txn| txn.waiting.is_some())
    }

    /// Returns the number of resources with lock state.
    pub fn lock_count(&self) -> usize {
        self.table.len()
    }

    /// Returns the number of registered transactions.
    pub fn txn_count(&self) -> usize {
        self.txns.len()
    }

    /// Returns the deadlock detector.
    pub fn detector(&self) -> &DeadlockDetector {
        &self.detector
    }

    /// Returns statistics.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn graph_enabled(&self) -> bool {
        self.config.deadlock_mode == DeadlockMode::Graph
    }

    /// Grants or queues a request under the resource guard. Returns the
    /// outcome and the parked waiters whose blocker sets grew.
    fn submit(
        &self,
        txn_id: TxnId,
        resource: &ResourceId,
        mode: LockMode,
        enqueue: bool,
    ) -> KeelResult<(LockResult, Vec<TxnId>)> {
        loop {
            let slot = self.table.slot(resource);
            let mut entry = slot.entry.lock();
            if entry.is_retired() {
                continue;
            }

            let mut txn = self
                .txns
                .get_mut(&txn_id)
                .ok_or(KeelError::UnknownTransaction { txn_id })?;
            if txn.closed {
                return Err(KeelError::TransactionAborted { txn_id });
            }
            txn.rejection = None;

            let held = entry.granted_mode(txn_id);
            if held.is_some_and(|h| h.covers(mode)) {
                return Ok((LockResult::Granted, Vec::new()));
            }
            let upgrade = held.is_some();
            let target = held.map_or(mode, |h| h.combine(mode));

            if self.grantable_now(&entry, txn_id, target, upgrade) {
                entry.grant(txn_id, target);
                txn.held.insert(resource.clone(), target);
                drop(txn);
                if upgrade {
                    self.stats.record_upgrade();
                } else {
                    self.stats.record_acquisition();
                }
                // A new or stronger holder can block queued waiters.
                let grown = if entry.queue_is_empty() {
                    Vec::new()
                } else {
                    self.sync_graph(resource, &entry, &[], &[])
                };
                return Ok((LockResult::Granted, grown));
            }

            if !enqueue {
                return Ok((LockResult::Blocked, Vec::new()));
            }

            let request = LockRequest {
                txn_id,
                mode: target,
                upgrade,
            };
            if upgrade {
                entry.enqueue_upgrade(request);
            } else {
                entry.enqueue(request);
            }
            txn.waiting = Some((resource.clone(), target));
            drop(txn);

            self.stats.record_wait();
            debug!(txn = %txn_id, resource = %resource, mode = %target, upgrade, "lock request queued");
            let grown = self.sync_graph(resource, &entry, &[], &[]);
            return Ok((LockResult::Blocked, grown));
        }
    }

    fn grantable_now(&self, entry: &LockEntry, txn_id: TxnId, mode: LockMode, upgrade: bool) -> bool {
        if !entry.compatible_with_holders(txn_id, mode) {
            return false;
        }
        match self.config.fairness {
            QueueFairness::Greedy => true,
            QueueFairness::Fifo if upgrade => !entry.has_queued_upgrade(),
            QueueFairness::Fifo => entry.queue_is_empty(),
        }
    }

    fn wait_state(&self, txn_id: TxnId, resource: &ResourceId) -> WaitState {
        let Some(mut txn) = self.txns.get_mut(&txn_id) else {
            return WaitState::Rejected(Rejection::Aborted);
        };
        if txn.waits_on(resource) {
            return WaitState::Queued;
        }
        if let Some(rejection) = txn.rejection.take() {
            return WaitState::Rejected(rejection);
        }
        if txn.closed {
            return WaitState::Rejected(Rejection::Aborted);
        }
        WaitState::Granted
    }

    /// Re-evaluates a resource after its holders or queue changed: grants
    /// what can be granted, refreshes the wait-for edges of the remaining
    /// waiters and wakes everyone parked on the slot.
    fn after_change(
        &self,
        resource: &ResourceId,
        entry: &mut LockEntry,
        slot: &LockSlot,
        departed: &[TxnId],
    ) -> Vec<TxnId> {
        let granted = self.grant_waiters(resource, entry);
        let grown = self.sync_graph(resource, entry, departed, &granted);
        slot.changed.notify_all();
        grown
    }

    fn grant_waiters(&self, resource: &ResourceId, entry: &mut LockEntry) -> Vec<TxnId> {
        let mut granted = Vec::new();
        let mut index = 0;
        while let Some(request) = entry.request_at(index) {
            if entry.compatible_with_holders(request.txn_id, request.mode) {
                entry.take_request(index);
                entry.grant(request.txn_id, request.mode);
                if let Some(mut txn) = self.txns.get_mut(&request.txn_id) {
                    txn.held.insert(resource.clone(), request.mode);
                    txn.waiting = None;
                }
                if request.upgrade {
                    self.stats.record_upgrade();
                } else {
                    self.stats.record_acquisition();
                }
                debug!(txn = %request.txn_id, resource = %resource, mode = %request.mode, "queued lock granted");
                granted.push(request.txn_id);
            } else if self.config.fairness == QueueFairness::Fifo {
                break;
            } else {
                index += 1;
            }
        }
        granted
    }

    /// Rewrites the wait-for edges of every waiter on `resource`.
    fn sync_graph(
        &self,
        resource: &ResourceId,
        entry: &LockEntry,
        departed: &[TxnId],
        granted: &[TxnId],
    ) -> Vec<TxnId> {
        if !self.graph_enabled() {
            return Vec::new();
        }

        let mut graph = self.detector.graph();
        for txn_id in departed.iter().chain(granted) {
            graph.clear_waits(*txn_id);
        }

        let mut grown = Vec::new();
        for index in 0..entry.queue_len() {
            let Some(request) = entry.request_at(index) else {
                break;
            };
            let mut blockers: Vec<TxnId> = entry
                .conflicting_holders(request.txn_id, request.mode)
                .collect();
            if self.config.fairness == QueueFairness::Fifo {
                blockers.extend(entry.predecessors(index));
            }
            if graph.set_waits(request.txn_id, resource.clone(), request.mode, blockers) {
                grown.push(request.txn_id);
            }
        }
        grown
    }

    /// Runs detection from each waiter whose blocker set grew.
    fn resolve_grown(&self, grown: &[TxnId], skip: TxnId) {
        for waiter in grown.iter().filter(|w| **w != skip) {
            self.resolve_deadlocks(*waiter, false);
        }
    }

    /// Breaks every cycle through `start`.
    ///
    /// If `start` is the requesting transaction and ends up as victim, the
    /// cycle is returned and the caller withdraws the request. Any other
    /// victim is rejected and loses its locks here.
    fn resolve_deadlocks(&self, start: TxnId, start_is_caller: bool) -> Option<Vec<TxnId>> {
        if !self.graph_enabled() {
            return None;
        }
        loop {
            let info = self.detector.check(start, |txn_id| self.locks_held(txn_id))?;
            if info.victim == start && start_is_caller {
                return Some(info.cycle);
            }
            let victim = info.victim;
            self.abort_victim(victim, info.cycle);
            if victim == start {
                return None;
            }
        }
    }

    fn abort_victim(&self, victim: TxnId, cycle: Vec<TxnId>) {
        if self.reject_waiter(victim, Rejection::Deadlock(cycle)) {
            let released = self.release_all(victim);
            self.stats.record_deadlock();
            debug!(victim = %victim, released, "deadlock victim rejected");
            return;
        }

        // The victim is no longer queued; drop whatever edges it left behind.
        let mut graph = self.detector.graph();
        let waiting = self
            .txns
            .get(&victim)
            .is_some_and(|txn| txn.waiting.is_some());
        if !waiting {
            graph.clear_waits(victim);
        }
    }

    /// Removes the queued request of a parked transaction and records why.
    fn reject_waiter(&self, txn_id: TxnId, rejection: Rejection) -> bool {
        let resource = match self.txns.get(&txn_id) {
            Some(txn) => match &txn.waiting {
                Some((resource, _)) => resource.clone(),
                None => return false,
            },
            None => return false,
        };
        self.cancel_request(txn_id, &resource, Some(rejection))
    }

    /// Withdraws the caller's own queued request.
    fn withdraw(&self, txn_id: TxnId, resource: &ResourceId) -> bool {
        self.cancel_request(txn_id, resource, None)
    }

    fn cancel_request(
        &self,
        txn_id: TxnId,
        resource: &ResourceId,
        rejection: Option<Rejection>,
    ) -> bool {
        let Some(slot) = self.table.get(resource) else {
            return false;
        };
        let grown = {
            let mut entry = slot.entry.lock();
            {
                let Some(mut txn) = self.txns.get_mut(&txn_id) else {
                    return false;
                };
                if !txn.waits_on(resource) {
                    return false;
                }
                txn.waiting = None;
                txn.rejection = rejection;
            }
            entry.remove_request(txn_id);
            self.after_change(resource, &mut entry, &slot, &[txn_id])
        };
        self.table.retire_if_idle(resource, &slot);
        self.resolve_grown(&grown, txn_id);
        true
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_count", &self.lock_count())
            .field("txn_count", &self.txn_count())
            .field("deadlock_mode", &self.config.deadlock_mode)
            .field("fairness", &self.config.fairness)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn t(n: u64) -> TxnId {
        TxnId::new(n)
    }

    fn manager(txns: u64) -> LockManager {
        manager_with(LockConfig::default(), txns)
    }

    fn manager_with(config: LockConfig, txns: u64) -> LockManager {
        let lm = LockManager::with_config(config);
        for n in 1..=txns {
            lm.register(t(n));
        }
        lm
    }

    fn wait_until_blocked(lm: &LockManager, txn_id: TxnId) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !lm.is_waiting(txn_id) {
            assert!(Instant::now() < deadline, "{txn_id} never blocked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn assert_holders_compatible(lm: &LockManager, resource: &ResourceId) {
        let holders = lm.holders(resource);
        for (i, (a, ma)) in holders.iter().enumerate() {
            for (b, mb) in &holders[i + 1..] {
                assert!(ma.is_compatible_with(mb), "{a}:{ma} conflicts with {b}:{mb}");
            }
        }
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let expected = [
            (IntentionShared, [true, true, true, true, false]),
            (IntentionExclusive, [true, true, false, false, false]),
            (Shared, [true, false, true, false, false]),
            (SharedIntentionExclusive, [true, false, false, false, false]),
            (Exclusive, [false, false, false, false, false]),
        ];
        for (mode, row) in expected {
            for (other, compatible) in LockMode::ALL.iter().zip(row) {
                assert_eq!(mode.is_compatible_with(other), compatible, "{mode} vs {other}");
                assert_eq!(other.is_compatible_with(&mode), compatible, "{other} vs {mode}");
            }
        }
    }

    #[test]
    fn test_combine_and_covers() {
        use LockMode::*;
        assert_eq!(Shared.combine(IntentionExclusive), SharedIntentionExclusive);
        assert_eq!(IntentionShared.combine(Shared), Shared);
        assert_eq!(Shared.combine(Exclusive), Exclusive);
        assert_eq!(SharedIntentionExclusive.combine(IntentionExclusive), SharedIntentionExclusive);
        assert!(Exclusive.covers(Shared));
        assert!(!Shared.covers(IntentionExclusive));
        assert_eq!(Exclusive.intention(), IntentionExclusive);
        assert_eq!(Shared.intention(), IntentionShared);
    }

    #[test]
    fn test_lock_stats() {
        let stats = LockStats::new();
        stats.record_acquisition();
        stats.record_acquisition();
        stats.record_release();
        stats.record_wait();
        stats.record_deadlock();
        stats.record_upgrade();

        assert_eq!(stats.acquisitions.load(AtomicOrdering::Relaxed), 2);
        assert_eq!(stats.releases.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(stats.waits.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(stats.deadlocks.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(stats.upgrades.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_shared_then_exclusive_blocks_until_release() {
        let lm = Arc::new(manager(2));
        let r1 = ResourceId::table(1);

        lm.acquire(t(1), &r1, LockMode::Shared).unwrap();

        let waiter = {
            let lm = Arc::clone(&lm);
            let r1 = r1.clone();
            thread::spawn(move || lm.acquire(t(2), &r1, LockMode::Exclusive))
        };
        wait_until_blocked(&lm, t(2));
        assert_eq!(lm.holders(&r1), vec![(t(1), LockMode::Shared)]);

        assert!(lm.release(t(1), &r1));
        waiter.join().unwrap().unwrap();
        assert_eq!(lm.holders(&r1), vec![(t(2), LockMode::Exclusive)]);
        assert!(!lm.is_waiting(t(2)));
    }

    #[test]
    fn test_unregistered_request_rejected() {
        let lm = LockManager::new();
        let err = lm
            .request(t(9), &ResourceId::table(1), LockMode::Shared)
            .unwrap_err();
        assert!(matches!(err, KeelError::UnknownTransaction { .. }));
    }

    #[test]
    fn test_covered_request_granted_immediately() {
        let lm = manager(1);
        let r = ResourceId::row(1, "k");
        assert_eq!(lm.request(t(1), &r, LockMode::Exclusive).unwrap(), LockResult::Granted);
        assert_eq!(lm.request(t(1), &r, LockMode::Shared).unwrap(), LockResult::Granted);
        assert_eq!(lm.held_mode(t(1), &r), Some(LockMode::Exclusive));
        assert_eq!(lm.locks_held(t(1)), 1);
    }

    #[test]
    fn test_shared_plus_intention_exclusive_is_six() {
        let lm = manager(2);
        let table = ResourceId::table(1);
        lm.acquire(t(1), &table, LockMode::Shared).unwrap();
        lm.acquire(t(1), &table, LockMode::IntentionExclusive).unwrap();
        assert_eq!(lm.held_mode(t(1), &table), Some(LockMode::SharedIntentionExclusive));

        // IS is the only mode compatible with SIX.
        assert_eq!(
            lm.try_acquire(t(2), &table, LockMode::IntentionExclusive).unwrap(),
            LockResult::Blocked
        );
        assert_eq!(
            lm.try_acquire(t(2), &table, LockMode::IntentionShared).unwrap(),
            LockResult::Granted
        );
    }

    #[test]
    fn test_try_acquire_never_queues() {
        let lm = manager(2);
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Exclusive).unwrap();
        assert_eq!(lm.try_acquire(t(2), &r, LockMode::Shared).unwrap(), LockResult::Blocked);
        assert!(lm.waiters(&r).is_empty());
        assert!(!lm.is_waiting(t(2)));
    }

    #[test]
    fn test_shared_waiters_granted_together() {
        let lm = manager(4);
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Exclusive).unwrap();
        assert_eq!(lm.request(t(2), &r, LockMode::Shared).unwrap(), LockResult::Blocked);
        assert_eq!(lm.request(t(3), &r, LockMode::Shared).unwrap(), LockResult::Blocked);
        assert_eq!(lm.request(t(4), &r, LockMode::Exclusive).unwrap(), LockResult::Blocked);

        lm.release(t(1), &r);
        assert_eq!(
            lm.holders(&r),
            vec![(t(2), LockMode::Shared), (t(3), LockMode::Shared)]
        );
        assert!(lm.is_waiting(t(4)));
        assert_holders_compatible(&lm, &r);

        lm.wait(t(2), &r).unwrap();
        lm.wait(t(3), &r).unwrap();
    }

    #[test]
    fn test_fifo_reader_does_not_bypass_writer() {
        let lm = manager(3);
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Shared).unwrap();
        assert_eq!(lm.request(t(2), &r, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        // Compatible with the holder, but the writer is queued first.
        assert_eq!(lm.request(t(3), &r, LockMode::Shared).unwrap(), LockResult::Blocked);

        lm.release(t(1), &r);
        assert_eq!(lm.holders(&r), vec![(t(2), LockMode::Exclusive)]);
        assert!(lm.is_waiting(t(3)));

        lm.release(t(2), &r);
        assert_eq!(lm.holders(&r), vec![(t(3), LockMode::Shared)]);
    }

    #[test]
    fn test_greedy_reader_bypasses_writer() {
        let config = LockConfig {
            fairness: QueueFairness::Greedy,
            ..Default::default()
        };
        let lm = manager_with(config, 3);
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Shared).unwrap();
        assert_eq!(lm.request(t(2), &r, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        assert_eq!(lm.request(t(3), &r, LockMode::Shared).unwrap(), LockResult::Granted);
        assert!(lm.is_waiting(t(2)));
    }

    #[test]
    fn test_upgrade_queued_ahead_of_waiters() {
        let lm = manager(4);
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Shared).unwrap();
        lm.acquire(t(2), &r, LockMode::Shared).unwrap();
        assert_eq!(lm.request(t(4), &r, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        assert_eq!(lm.request(t(1), &r, LockMode::Exclusive).unwrap(), LockResult::Blocked);

        let order: Vec<TxnId> = lm.waiters(&r).iter().map(|w| w.txn_id).collect();
        assert_eq!(order, vec![t(1), t(4)]);

        lm.release(t(2), &r);
        assert_eq!(lm.holders(&r), vec![(t(1), LockMode::Exclusive)]);
        assert!(lm.is_waiting(t(4)));
        lm.wait(t(1), &r).unwrap();
        assert_eq!(lm.stats().upgrades.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_two_transaction_deadlock_picks_younger() {
        let lm = manager(2);
        let r1 = ResourceId::row(1, "a");
        let r2 = ResourceId::row(1, "b");
        lm.acquire(t(1), &r1, LockMode::Exclusive).unwrap();
        lm.acquire(t(2), &r2, LockMode::Exclusive).unwrap();

        assert_eq!(lm.request(t(1), &r2, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        let result = lm.request(t(2), &r1, LockMode::Exclusive).unwrap();
        match result {
            LockResult::Deadlock { cycle } => {
                assert_eq!(cycle.len(), 2);
                assert_eq!(cycle[0], t(2));
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
        assert!(!lm.is_waiting(t(2)));

        lm.close(t(2));
        lm.wait(t(1), &r2).unwrap();
        assert_eq!(lm.held_mode(t(1), &r2), Some(LockMode::Exclusive));
        assert_eq!(lm.stats().deadlocks.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_parked_victim_with_fewer_locks() {
        let lm = manager(2);
        let r1 = ResourceId::row(1, "a");
        let r2 = ResourceId::row(1, "b");
        let r3 = ResourceId::row(1, "c");
        lm.acquire(t(1), &r1, LockMode::Exclusive).unwrap();
        lm.acquire(t(2), &r2, LockMode::Exclusive).unwrap();
        lm.acquire(t(2), &r3, LockMode::Exclusive).unwrap();

        assert_eq!(lm.request(t(1), &r2, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        // T1 holds one lock, T2 two: the parked T1 is the victim and its lock
        // on r1 passes straight to T2.
        assert_eq!(lm.request(t(2), &r1, LockMode::Exclusive).unwrap(), LockResult::Granted);

        let err = lm.wait(t(1), &r2).unwrap_err();
        assert!(matches!(err, KeelError::Deadlock { txn_id, .. } if txn_id == t(1)));
        assert_eq!(lm.locks_held(t(1)), 0);
        assert_eq!(lm.holders(&r1), vec![(t(2), LockMode::Exclusive)]);
    }

    #[test]
    fn test_upgrade_deadlock() {
        let lm = manager(2);
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Shared).unwrap();
        lm.acquire(t(2), &r, LockMode::Shared).unwrap();

        assert_eq!(lm.request(t(1), &r, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        let result = lm.request(t(2), &r, LockMode::Exclusive).unwrap();
        assert!(matches!(result, LockResult::Deadlock { .. }));

        lm.close(t(2));
        lm.wait(t(1), &r).unwrap();
        assert_eq!(lm.holders(&r), vec![(t(1), LockMode::Exclusive)]);
    }

    #[test]
    fn test_deadlock_through_queue_order() {
        let lm = manager(3);
        let r1 = ResourceId::row(1, "a");
        let r3 = ResourceId::row(1, "c");
        lm.acquire(t(1), &r1, LockMode::Shared).unwrap();
        lm.acquire(t(3), &r3, LockMode::Exclusive).unwrap();

        assert_eq!(lm.request(t(2), &r1, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        // T3 is compatible with T1 but queued behind T2.
        assert_eq!(lm.request(t(3), &r1, LockMode::Shared).unwrap(), LockResult::Blocked);

        // T1 -> T3 -> T2 -> T1. T2 holds nothing and is the victim.
        assert_eq!(lm.request(t(1), &r3, LockMode::Exclusive).unwrap(), LockResult::Blocked);
        let err = lm.wait(t(2), &r1).unwrap_err();
        assert!(matches!(err, KeelError::Deadlock { .. }));

        lm.wait(t(3), &r1).unwrap();
        assert_eq!(
            lm.holders(&r1),
            vec![(t(1), LockMode::Shared), (t(3), LockMode::Shared)]
        );
        assert!(lm.is_waiting(t(1)));
    }

    #[test]
    fn test_three_way_deadlock_across_threads() {
        let lm = Arc::new(manager(3));
        let resources: Vec<ResourceId> = (0..3).map(|i| ResourceId::row(1, format!("r{i}"))).collect();
        for (i, r) in resources.iter().enumerate() {
            lm.acquire(t(i as u64 + 1), r, LockMode::Exclusive).unwrap();
        }

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let lm = Arc::clone(&lm);
                let next = resources[(i + 1) % 3].clone();
                let txn = t(i as u64 + 1);
                thread::spawn(move || {
                    let result = lm.acquire(txn, &next, LockMode::Exclusive);
                    lm.close(txn);
                    (txn, result)
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let victims: Vec<TxnId> = outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Err(KeelError::Deadlock { .. })))
            .map(|(txn, _)| *txn)
            .collect();
        assert_eq!(victims, vec![t(3)]);
        assert!(outcomes.iter().filter(|(_, r)| r.is_ok()).count() == 2);
    }

    #[test]
    fn test_timeout_mode() {
        let config = LockConfig {
            deadlock_mode: DeadlockMode::Timeout,
            lock_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let lm = manager_with(config, 2);
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Exclusive).unwrap();

        let started = Instant::now();
        let err = lm.acquire(t(2), &r, LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, KeelError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(lm.waiters(&r).is_empty());
        assert!(!lm.is_waiting(t(2)));
        assert_eq!(lm.stats().timeouts.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(lm.detector().graph().waiter_count(), 0);
    }

    #[test]
    fn test_close_cancels_blocked_wait() {
        let lm = Arc::new(manager(2));
        let r = ResourceId::row(1, "k");
        lm.acquire(t(1), &r, LockMode::Exclusive).unwrap();

        let waiter = {
            let lm = Arc::clone(&lm);
            let r = r.clone();
            thread::spawn(move || lm.acquire(t(2), &r, LockMode::Exclusive))
        };
        wait_until_blocked(&lm, t(2));

        assert_eq!(lm.close(t(2)), 0);
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, KeelError::TransactionAborted { .. }));
        assert_eq!(lm.holders(&r), vec![(t(1), LockMode::Exclusive)]);
        assert!(lm.waiters(&r).is_empty());

        // Closed transactions can no longer request locks.
        assert!(lm.request(t(2), &r, LockMode::Shared).is_err());
    }

    #[test]
    fn test_idle_entries_are_retired() {
        let lm = manager(2);
        for i in 0..10 {
            lm.acquire(t(1), &ResourceId::row(1, format!("k{i}")), LockMode::Exclusive)
                .unwrap();
        }
        assert_eq!(lm.lock_count(), 10);
        assert_eq!(lm.release_all(t(1)), 10);
        assert_eq!(lm.lock_count(), 0);

        lm.acquire(t(2), &ResourceId::table(1), LockMode::Shared).unwrap();
        assert_eq!(lm.close(t(2)), 1);
        assert_eq!(lm.lock_count(), 0);
        assert_eq!(lm.txn_count(), 1);
    }
}
