//! Transaction manager for coordinating transaction lifecycle.
//!
//! This module provides the façade the query layer talks to:
//! - Transaction lifecycle (begin, commit, abort)
//! - Reads through a snapshot (snapshot isolation) or under shared locks
//!   (serializable)
//! - Buffered writes under exclusive locks, published atomically at commit
//! - First-committer-wins validation for snapshot isolation
//! - Garbage collection of versions no snapshot can observe
//!
//! # Transaction States
//!
//! ```text
//! ┌───────┐    begin()    ┌─────────┐  release_lock()  ┌───────────┐
//! │ Start │──────────────▶│ Growing │─────────────────▶│ Shrinking │
//! └───────┘               └─────────┘   (conventional)  └───────────┘
//!                              │                              │
//!                    ┌─────────┴──────────────┬───────────────┘
//!                    │                        │
//!               commit()                   abort()
//!                    │                        │
//!                    ▼                        ▼
//!             ┌───────────┐            ┌──────────┐
//!             │ Committed │            │ Aborted  │
//!             └───────────┘            └──────────┘
//! ```
//!
//! Every error that ends a transaction (deadlock, lock timeout, write
//! conflict, phase violation) aborts it before returning, so no locks or
//! pending writes outlive the failure.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_common::config::{CoreConfig, Isolation};
use keel_common::constants::{BOOTSTRAP_TIMESTAMP, BOOTSTRAP_TXN_ID, FIRST_TXN_ID};
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{ResourceId, Timestamp, TxnId, TxnPhase, Value};
use keel_mvcc::{
    GarbageCollector, GcResult, GcWorker, Snapshot, SnapshotRegistry, TimestampOracle,
    VersionStore, WriteSet,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::lock::{LockManager, LockMode};
use crate::twopl::TwoPhaseLocking;

/// An active transaction.
struct Transaction {
    /// Unique transaction ID.
    id: TxnId,
    /// Isolation level.
    isolation: Isolation,
    /// Read-visibility horizon.
    snapshot: Snapshot,
    /// Pending writes, invisible to others until commit.
    writes: WriteSet,
    /// `Growing` until the transaction ends.
    phase: TxnPhase,
    /// When the transaction started.
    started_at: Instant,
}

impl Transaction {
    fn ensure_active(&self) -> KeelResult<()> {
        match self.phase {
            TxnPhase::Aborted => Err(KeelError::TransactionAborted { txn_id: self.id }),
            TxnPhase::Committed => Err(KeelError::UnknownTransaction { txn_id: self.id }),
            TxnPhase::Growing | TxnPhase::Shrinking => Ok(()),
        }
    }

    fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("isolation", &self.isolation)
            .field("snapshot_ts", &self.snapshot.read_ts())
            .field("writes", &self.writes.len())
            .finish()
    }
}

/// Point-in-time view of an active transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// The transaction ID.
    pub txn_id: TxnId,
    /// Two-phase locking phase.
    pub phase: TxnPhase,
    /// Isolation level.
    pub isolation: Isolation,
    /// Snapshot timestamp taken at begin.
    pub snapshot_ts: Timestamp,
    /// Number of locks currently held.
    pub locks_held: usize,
    /// Number of buffered writes.
    pub pending_writes: usize,
}

/// How a finished transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed(Timestamp),
    Aborted,
}

impl Outcome {
    fn phase(self) -> TxnPhase {
        match self {
            Outcome::Committed(_) => TxnPhase::Committed,
            Outcome::Aborted => TxnPhase::Aborted,
        }
    }
}

/// Bounded memory of recent outcomes, oldest evicted first.
struct FinishedLog {
    outcomes: HashMap<TxnId, Outcome>,
    order: VecDeque<TxnId>,
    capacity: usize,
}

impl FinishedLog {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, txn_id: TxnId, outcome: Outcome) {
        if self.outcomes.insert(txn_id, outcome).is_none() {
            self.order.push_back(txn_id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.outcomes.remove(&evicted);
            }
        }
    }

    fn get(&self, txn_id: TxnId) -> Option<Outcome> {
        self.outcomes.get(&txn_id).copied()
    }
}

/// Statistics about the transaction manager.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Total transactions started.
    pub started: AtomicU64,
    /// Total transactions committed.
    pub committed: AtomicU64,
    /// Total transactions aborted.
    pub aborted: AtomicU64,
    /// Currently active transactions.
    pub active: AtomicU64,
    /// Total write conflicts detected at commit.
    pub conflicts: AtomicU64,
    /// Total transactions aborted as deadlock victims.
    pub deadlocks: AtomicU64,
}

impl TransactionStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

type TxnHandle = Arc<Mutex<Transaction>>;

/// The transaction manager coordinates all transaction operations.
pub struct TransactionManager {
    /// Single source of snapshot and commit timestamps.
    oracle: Arc<TimestampOracle>,
    /// Committed versions.
    store: Arc<VersionStore>,
    /// Snapshots of active transactions.
    snapshots: Arc<SnapshotRegistry>,
    /// Reclaims versions below the oldest active snapshot.
    collector: Arc<GarbageCollector>,
    /// Background collector, if configured.
    gc_worker: Mutex<Option<GcWorker>>,
    /// Lock acquisition under two-phase locking.
    twopl: TwoPhaseLocking,
    /// Active transactions.
    active: RwLock<HashMap<TxnId, TxnHandle>>,
    /// Outcomes of recently finished transactions.
    finished: Mutex<FinishedLog>,
    /// Set once `shutdown` has been called.
    shutting_down: AtomicBool,
    /// Configuration.
    config: CoreConfig,
    /// Statistics.
    stats: TransactionStats,
    /// Next transaction ID.
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    /// Creates a transaction manager with the default configuration.
    pub fn new() -> Self {
        Self::build(CoreConfig::default())
    }

    /// Creates a transaction manager with custom configuration.
    pub fn with_config(config: CoreConfig) -> KeelResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: CoreConfig) -> Self {
        let oracle = Arc::new(TimestampOracle::new());
        let store = Arc::new(VersionStore::new());
        let snapshots = Arc::new(SnapshotRegistry::new());
        let collector = Arc::new(GarbageCollector::with_config(
            Arc::clone(&store),
            Arc::clone(&snapshots),
            Arc::clone(&oracle),
            config.gc.clone(),
        ));
        let gc_worker = config
            .gc
            .interval
            .map(|interval| GcWorker::spawn(Arc::clone(&collector), interval));
        let locks = Arc::new(LockManager::with_config(config.lock.clone()));
        let twopl = TwoPhaseLocking::new(locks, config.locking, config.hierarchical_locking);

        Self {
            oracle,
            store,
            snapshots,
            collector,
            gc_worker: Mutex::new(gc_worker),
            twopl,
            active: RwLock::new(HashMap::new()),
            finished: Mutex::new(FinishedLog::new(config.finished_retention)),
            shutting_down: AtomicBool::new(false),
            config,
            stats: TransactionStats::new(),
            next_txn_id: AtomicU64::new(FIRST_TXN_ID),
        }
    }

    /// Begins a new transaction with the default isolation level.
    pub fn begin(&self) -> KeelResult<TxnId> {
        self.begin_with_isolation(self.config.default_isolation)
    }

    /// Begins a new transaction with a specific isolation level.
    pub fn begin_with_isolation(&self, isolation: Isolation) -> KeelResult<TxnId> {
        let mut active = self.active.write();
        if self.shutting_down.load(AtomicOrdering::Acquire) {
            return Err(KeelError::ShuttingDown);
        }

        let txn_id = TxnId::new(self.next_txn_id.fetch_add(1, AtomicOrdering::SeqCst));
        let snapshot = self.snapshots.open(&self.oracle, txn_id);
        self.twopl.begin(txn_id);

        let txn = Transaction {
            id: txn_id,
            isolation,
            snapshot,
            writes: WriteSet::new(),
            phase: TxnPhase::Growing,
            started_at: Instant::now(),
        };
        active.insert(txn_id, Arc::new(Mutex::new(txn)));
        drop(active);

        self.stats.started.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.active.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(txn = %txn_id, isolation = ?isolation, snapshot = %snapshot.read_ts(), "transaction started");

        Ok(txn_id)
    }

    /// Reads `resource`.
    ///
    /// Pending writes of the transaction itself are returned first. Under
    /// snapshot isolation the value visible at the snapshot is returned
    /// without locking; under serializable isolation a shared lock is taken
    /// and the latest committed value is returned. `None` means the resource
    /// does not exist or was deleted.
    pub fn read(&self, txn_id: TxnId, resource: &ResourceId) -> KeelResult<Option<Value>> {
        let handle = self.handle(txn_id)?;
        let (isolation, snapshot) = {
            let txn = handle.lock();
            txn.ensure_active()?;
            if let Some(pending) = txn.writes.get(resource) {
                return Ok(pending.cloned());
            }
            (txn.isolation, txn.snapshot)
        };

        match isolation {
            Isolation::SnapshotIsolation => {
                let value = self.store.read(resource, snapshot.read_ts());
                handle.lock().ensure_active()?;
                Ok(value)
            }
            Isolation::Serializable => {
                self.lock(txn_id, resource, LockMode::Shared)?;
                Ok(self.store.read_latest(resource))
            }
        }
    }

    /// Buffers a write of `value` to `resource` under an exclusive lock.
    pub fn write(&self, txn_id: TxnId, resource: ResourceId, value: Value) -> KeelResult<()> {
        self.buffer(txn_id, resource, Some(value))
    }

    /// Buffers a deletion of `resource` under an exclusive lock.
    pub fn delete(&self, txn_id: TxnId, resource: ResourceId) -> KeelResult<()> {
        self.buffer(txn_id, resource, None)
    }

    /// Commits a transaction and returns its commit timestamp.
    ///
    /// Under snapshot isolation the write set is validated first; on a
    /// conflict the transaction is aborted and `WriteConflict` returned.
    /// Committing an already committed transaction returns the original
    /// timestamp.
    ///
    /// Only writes buffered before the call are published. A `read` or
    /// `write` of the same transaction still blocked on another thread is
    /// cancelled and fails with `UnknownTransaction`.
    pub fn commit(&self, txn_id: TxnId) -> KeelResult<Timestamp> {
        let Some(handle) = self.take(txn_id) else {
            return match self.outcome(txn_id) {
                Some(Outcome::Committed(commit_ts)) => Ok(commit_ts),
                Some(Outcome::Aborted) => Err(KeelError::TransactionAborted { txn_id }),
                None => Err(KeelError::UnknownTransaction { txn_id }),
            };
        };
        let mut txn = handle.lock();

        let published = {
            let window = self.oracle.commit_window();
            let validated = match txn.isolation {
                Isolation::SnapshotIsolation => {
                    self.store
                        .validate(txn_id, &txn.writes, txn.snapshot.read_ts())
                }
                Isolation::Serializable => Ok(()),
            };
            validated.map(|()| {
                let commit_ts = window.commit_timestamp();
                self.store.publish(txn_id, &txn.writes, commit_ts);
                commit_ts
            })
        };

        match published {
            Ok(commit_ts) => {
                let writes = txn.writes.len();
                self.finish(&mut txn, Outcome::Committed(commit_ts));
                self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(txn = %txn_id, commit_ts = %commit_ts, writes, "transaction committed");
                Ok(commit_ts)
            }
            Err(err) => {
                self.stats.conflicts.fetch_add(1, AtomicOrdering::Relaxed);
                self.finish(&mut txn, Outcome::Aborted);
                self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(txn = %txn_id, error = %err, "commit failed, transaction aborted");
                Err(err)
            }
        }
    }

    /// Aborts a transaction, discarding its pending writes and releasing its
    /// locks. A wait the transaction is blocked in from another thread
    /// fails with `TransactionAborted`. Aborting a finished transaction is a
    /// no-op.
    pub fn abort(&self, txn_id: TxnId) -> KeelResult<()> {
        if self.abort_active(txn_id, "requested") {
            return Ok(());
        }
        match self.outcome(txn_id) {
            Some(_) => Ok(()),
            None => Err(KeelError::UnknownTransaction { txn_id }),
        }
    }

    /// Releases one lock early. Only allowed under the conventional
    /// protocol; moves the transaction to `Shrinking`.
    pub fn release_lock(&self, txn_id: TxnId, resource: &ResourceId) -> KeelResult<bool> {
        let handle = self.handle(txn_id)?;
        handle.lock().ensure_active()?;
        self.twopl.release(txn_id, resource)
    }

    /// Installs `value` as the initial committed version of `resource`,
    /// visible to every snapshot.
    ///
    /// Returns false without installing anything while a snapshot is open,
    /// or if the resource has ever had versions, including ones already
    /// reclaimed.
    pub fn preload(&self, resource: ResourceId, value: Value) -> bool {
        // No snapshot can open while the window is held.
        let _window = self.oracle.commit_window();
        if self.snapshots.min_active().is_some() || self.store.has_history(&resource) {
            debug!(resource = %resource, "preload refused");
            return false;
        }
        self.store
            .install(resource, BOOTSTRAP_TXN_ID, Some(value), BOOTSTRAP_TIMESTAMP);
        true
    }

    /// Returns information about an active transaction.
    pub fn transaction(&self, txn_id: TxnId) -> Option<TransactionInfo> {
        let handle = self.active.read().get(&txn_id).cloned()?;
        let txn = handle.lock();
        Some(TransactionInfo {
            txn_id,
            phase: self.twopl.phase(txn_id).unwrap_or(txn.phase),
            isolation: txn.isolation,
            snapshot_ts: txn.snapshot.read_ts(),
            locks_held: self.twopl.locks().locks_held(txn_id),
            pending_writes: txn.writes.len(),
        })
    }

    /// Returns the phase of an active or recently finished transaction.
    pub fn status(&self, txn_id: TxnId) -> Option<TxnPhase> {
        if let Some(info) = self.transaction(txn_id) {
            return Some(info.phase);
        }
        self.outcome(txn_id).map(Outcome::phase)
    }

    /// Runs one garbage collection pass.
    pub fn collect_garbage(&self) -> GcResult {
        self.collector.collect_once()
    }

    /// Stops the background collector, rejects new transactions and aborts
    /// every active one. Returns the number of transactions aborted.
    pub fn shutdown(&self) -> usize {
        let txn_ids: Vec<TxnId> = {
            let active = self.active.write();
            self.shutting_down.store(true, AtomicOrdering::Release);
            active.keys().copied().collect()
        };
        if let Some(mut worker) = self.gc_worker.lock().take() {
            worker.stop();
        }

        let aborted = txn_ids
            .into_iter()
            .filter(|txn_id| self.abort_active(*txn_id, "shutdown"))
            .count();
        info!(aborted, "transaction manager shut down");
        aborted
    }

    /// Returns true once `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(AtomicOrdering::Acquire)
    }

    /// Returns the number of active transactions.
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Returns statistics.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Returns the lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.twopl.locks()
    }

    /// Returns the version store.
    pub fn version_store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    /// Returns the timestamp oracle.
    pub fn oracle(&self) -> &Arc<TimestampOracle> {
        &self.oracle
    }

    /// Returns the garbage collector.
    pub fn garbage_collector(&self) -> &Arc<GarbageCollector> {
        &self.collector
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn handle(&self, txn_id: TxnId) -> KeelResult<TxnHandle> {
        if let Some(handle) = self.active.read().get(&txn_id) {
            return Ok(Arc::clone(handle));
        }
        match self.outcome(txn_id) {
            Some(Outcome::Aborted) => Err(KeelError::TransactionAborted { txn_id }),
            _ => Err(KeelError::UnknownTransaction { txn_id }),
        }
    }

    /// Removes a transaction from the active set. Whoever removes it owns
    /// its completion.
    fn take(&self, txn_id: TxnId) -> Option<TxnHandle> {
        self.active.write().remove(&txn_id)
    }

    fn outcome(&self, txn_id: TxnId) -> Option<Outcome> {
        self.finished.lock().get(txn_id)
    }

    fn buffer(&self, txn_id: TxnId, resource: ResourceId, value: Option<Value>) -> KeelResult<()> {
        let handle = self.handle(txn_id)?;
        handle.lock().ensure_active()?;

        // Never block on a lock while holding the transaction.
        self.lock(txn_id, &resource, LockMode::Exclusive)?;

        let mut txn = handle.lock();
        txn.ensure_active()?;
        match value {
            Some(value) => txn.writes.put(resource, value),
            None => txn.writes.delete(resource),
        }
        Ok(())
    }

    /// Acquires a lock through the 2PL coordinator, aborting the transaction
    /// if the failure ends it.
    fn lock(&self, txn_id: TxnId, resource: &ResourceId, mode: LockMode) -> KeelResult<()> {
        let err = match self.twopl.acquire(txn_id, resource, mode) {
            Ok(()) => return Ok(()),
            // The transaction ended on another thread while this call was
            // in flight, possibly while parked in a lock queue.
            Err(KeelError::UnknownTransaction { .. } | KeelError::TransactionAborted { .. }) => {
                return Err(match self.outcome(txn_id) {
                    Some(Outcome::Committed(_)) => KeelError::UnknownTransaction { txn_id },
                    _ => KeelError::TransactionAborted { txn_id },
                });
            }
            Err(err) => err,
        };

        match &err {
            KeelError::Deadlock { .. } => {
                self.stats.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
                self.abort_active(txn_id, "deadlock victim");
            }
            KeelError::LockTimeout { .. } => {
                self.abort_active(txn_id, "lock timeout");
            }
            KeelError::InvalidPhaseTransition { .. } => {
                self.abort_active(txn_id, "phase violation");
            }
            _ => {}
        }
        Err(err)
    }

    fn abort_active(&self, txn_id: TxnId, reason: &'static str) -> bool {
        let Some(handle) = self.take(txn_id) else {
            return false;
        };
        let mut txn = handle.lock();
        let discarded = txn.writes.len();
        let elapsed_ms = txn.duration().as_millis() as u64;
        self.finish(&mut txn, Outcome::Aborted);
        self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(txn = %txn_id, reason, discarded, elapsed_ms, "transaction aborted");
        true
    }

    /// Releases locks, the snapshot and pending writes of a transaction
    /// already removed from the active set.
    fn finish(&self, txn: &mut Transaction, outcome: Outcome) {
        txn.phase = outcome.phase();
        txn.writes.clear();
        // Recorded first so a call woken by the lock release sees the outcome.
        self.finished.lock().record(txn.id, outcome);
        self.twopl.finish(txn.id, txn.phase);
        self.snapshots.unregister(&txn.snapshot);
        self.stats.active.fetch_sub(1, AtomicOrdering::Relaxed);
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .field("lock_count", &self.twopl.locks().lock_count())
            .field("version_count", &self.store.version_count())
            .finish()
    }
}
