//! Snapshot visibility and the active snapshot registry.
//!
//! A [`Snapshot`] is the read-visibility horizon of one transaction: it
//! observes exactly the versions committed at or before its timestamp.
//!
//! # Read Visibility Rules
//!
//! A version V is visible to snapshot S if:
//! 1. V was committed at or before S was taken (`V.begin_ts <= S.read_ts`), AND
//! 2. V was not superseded at or before S was taken (`S.read_ts < V.end_ts`)
//!
//! Uncommitted writes live outside the version store, so a transaction's own
//! pending writes are resolved by the caller before consulting a snapshot.
//!
//! The [`SnapshotRegistry`] tracks every snapshot still in use. Its minimum is
//! the garbage-collection horizon: versions that ended before it can no
//! longer be read by anyone.

use std::collections::BTreeMap;
use std::fmt;

use keel_common::types::{Timestamp, TxnId};
use parking_lot::Mutex;

use crate::clock::TimestampOracle;
use crate::version::Version;

/// A consistent view of the store as of one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// The timestamp of this snapshot.
    read_ts: Timestamp,
    /// Transaction that owns this snapshot.
    txn_id: TxnId,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(txn_id: TxnId, read_ts: Timestamp) -> Self {
        Self { read_ts, txn_id }
    }

    /// Returns the read timestamp.
    pub fn read_ts(&self) -> Timestamp {
        self.read_ts
    }

    /// Returns the owning transaction.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Checks if a committed version is visible in this snapshot.
    pub fn is_visible(&self, version: &Version) -> bool {
        version.is_visible_at(self.read_ts)
    }
}

/// Tracks the snapshot timestamps of all active transactions.
///
/// Timestamps are kept in an ordered multiset so the running minimum is
/// available in O(log n) after every begin, commit or abort.
pub struct SnapshotRegistry {
    active: Mutex<BTreeMap<Timestamp, usize>>,
}

impl SnapshotRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// Takes a fresh snapshot for `txn_id` and registers it before any
    /// commit can publish past it.
    pub fn open(&self, oracle: &TimestampOracle, txn_id: TxnId) -> Snapshot {
        oracle.begin_snapshot_with(|read_ts| {
            let snapshot = Snapshot::new(txn_id, read_ts);
            self.register(&snapshot);
            snapshot
        })
    }

    /// Registers a snapshot as in use.
    pub fn register(&self, snapshot: &Snapshot) {
        *self.active.lock().entry(snapshot.read_ts).or_insert(0) += 1;
    }

    /// Marks a snapshot as no longer in use.
    pub fn unregister(&self, snapshot: &Snapshot) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&snapshot.read_ts) {
            *count -= 1;
            if *count == 0 {
                active.remove(&snapshot.read_ts);
            }
        }
    }

    /// Returns the oldest snapshot timestamp still in use.
    pub fn min_active(&self) -> Option<Timestamp> {
        self.active.lock().keys().next().copied()
    }

    /// Returns the number of registered snapshots.
    pub fn active_count(&self) -> usize {
        self.active.lock().values().sum()
    }
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotRegistry")
            .field("active_count", &self.active_count())
            .field("min_active", &self.min_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::types::VersionId;

    #[test]
    fn test_snapshot_visibility() {
        let snapshot = Snapshot::new(TxnId::new(2), Timestamp::new(11));
        let mut old = Version::new(VersionId::new(1), TxnId::new(1), None, Timestamp::new(0));
        let new = Version::new(VersionId::new(2), TxnId::new(3), None, Timestamp::new(12));
        old.end_ts = Timestamp::new(12);

        assert!(snapshot.is_visible(&old));
        assert!(!snapshot.is_visible(&new));
        assert_eq!(snapshot.txn_id(), TxnId::new(2));
    }

    #[test]
    fn test_registry_running_minimum() {
        let registry = SnapshotRegistry::new();
        assert_eq!(registry.min_active(), None);

        let s1 = Snapshot::new(TxnId::new(1), Timestamp::new(10));
        let s2 = Snapshot::new(TxnId::new(2), Timestamp::new(11));
        let s3 = Snapshot::new(TxnId::new(3), Timestamp::new(13));
        registry.register(&s1);
        registry.register(&s2);
        registry.register(&s3);
        assert_eq!(registry.min_active(), Some(Timestamp::new(10)));
        assert_eq!(registry.active_count(), 3);

        registry.unregister(&s1);
        assert_eq!(registry.min_active(), Some(Timestamp::new(11)));

        registry.unregister(&s3);
        registry.unregister(&s2);
        assert_eq!(registry.min_active(), None);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_registry_open() {
        let oracle = TimestampOracle::starting_at(10);
        let registry = SnapshotRegistry::new();

        let s1 = registry.open(&oracle, TxnId::new(1));
        let s2 = registry.open(&oracle, TxnId::new(2));
        assert_eq!(s1.read_ts(), Timestamp::new(10));
        assert_eq!(s2.read_ts(), Timestamp::new(11));
        assert_eq!(registry.min_active(), Some(Timestamp::new(10)));
    }

    #[test]
    fn test_registry_shared_timestamp() {
        let registry = SnapshotRegistry::new();
        let a = Snapshot::new(TxnId::new(1), Timestamp::new(5));
        let b = Snapshot::new(TxnId::new(2), Timestamp::new(5));
        registry.register(&a);
        registry.register(&b);

        registry.unregister(&a);
        assert_eq!(registry.min_active(), Some(Timestamp::new(5)));
        registry.unregister(&b);
        assert_eq!(registry.min_active(), None);

        // Unknown snapshots are ignored.
        registry.unregister(&a);
        assert_eq!(registry.active_count(), 0);
    }
}
