//! Version chain storage and management.
//!
//! Every resource owns a chain of committed versions, newest first. Each
//! version carries the half-open interval `[begin_ts, end_ts)` during which
//! it is the current value; exactly one version per chain is open
//! (`end_ts == Timestamp::MAX`).
//!
//! # Version Chain Structure
//!
//! ```text
//! Resource: row:1/alice
//! ┌─────────────────────────────────────────────────────┐
//! │ v7 (open)                                           │
//! │ begin_ts: 150, end_ts: open, txn: T5                │
//! │ value: "Alice (updated)"                            │
//! │                     ↓                               │
//! │ v4                                                  │
//! │ begin_ts: 100, end_ts: 150, txn: T3                 │
//! │ value: "Alice"                                      │
//! │                     ↓                               │
//! │ v1 (oldest retained)                                │
//! │ begin_ts: 0, end_ts: 100, txn: T0                   │
//! │ value: "Initial Alice"                              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Uncommitted writes never enter a chain. They are buffered in a
//! [`WriteSet`] owned by the writing transaction, checked with
//! [`VersionStore::validate`] and published with [`VersionStore::publish`]
//! inside the oracle's commit window.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{ResourceId, Timestamp, TxnId, Value, VersionId};
use parking_lot::RwLock;

/// A single committed version of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Unique identifier for this version.
    pub id: VersionId,
    /// Transaction that committed this version.
    pub created_by: TxnId,
    /// The payload; `None` marks a deletion.
    pub value: Option<Value>,
    /// Commit timestamp of the creator.
    pub begin_ts: Timestamp,
    /// Commit timestamp of the successor, or `Timestamp::MAX` while open.
    pub end_ts: Timestamp,
}

impl Version {
    /// Creates a new open version.
    pub fn new(id: VersionId, created_by: TxnId, value: Option<Value>, begin_ts: Timestamp) -> Self {
        Self {
            id,
            created_by,
            value,
            begin_ts,
            end_ts: Timestamp::MAX,
        }
    }

    /// Checks if this version is the current value at `ts`.
    pub fn is_visible_at(&self, ts: Timestamp) -> bool {
        self.begin_ts <= ts && ts < self.end_ts
    }

    /// Returns true while no newer version has been committed.
    pub fn is_open(&self) -> bool {
        self.end_ts.is_open()
    }

    /// Returns true if this version records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Checks if no snapshot at or after `horizon` can observe this version.
    pub fn can_gc(&self, horizon: Timestamp) -> bool {
        self.end_ts < horizon
    }

    /// Returns the approximate size of this version in bytes.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.value.as_ref().map_or(0, Value::len)
    }
}

/// A chain of versions for a single resource.
#[derive(Debug)]
pub struct VersionChain {
    /// The resource this chain belongs to.
    resource: ResourceId,
    /// All retained versions, newest first.
    versions: RwLock<Vec<Version>>,
    /// Total size in bytes.
    total_size: AtomicU64,
}

impl VersionChain {
    /// Creates a new empty version chain.
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            versions: RwLock::new(Vec::new()),
            total_size: AtomicU64::new(0),
        }
    }

    /// Returns the resource for this chain.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Returns the number of retained versions.
    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    /// Returns true if the chain holds no versions.
    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }

    /// Returns the total size of all retained versions.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(AtomicOrdering::Relaxed)
    }

    /// Appends a new open version, closing the previous open version at the
    /// new version's begin timestamp.
    fn install(&self, version: Version) {
        let size = version.size() as u64;
        let mut versions = self.versions.write();
        if let Some(current) = versions.first_mut() {
            debug_assert!(current.begin_ts <= version.begin_ts);
            current.end_ts = version.begin_ts;
        }
        versions.insert(0, version);
        self.total_size.fetch_add(size, AtomicOrdering::Relaxed);
    }

    /// Returns the version that was current at `ts`.
    pub fn read_at(&self, ts: Timestamp) -> Option<Version> {
        let versions = self.versions.read();
        versions.iter().find(|v| v.is_visible_at(ts)).cloned()
    }

    /// Returns the open version.
    pub fn latest(&self) -> Option<Version> {
        self.versions.read().first().cloned()
    }

    /// Returns the commit timestamp of the open version.
    pub fn latest_commit_ts(&self) -> Option<Timestamp> {
        self.versions.read().first().map(|v| v.begin_ts)
    }

    /// Drops closed versions no snapshot at or after `horizon` can observe.
    /// At most `budget` versions are removed. Returns the number removed.
    fn gc(&self, horizon: Timestamp, budget: usize) -> usize {
        if budget == 0 {
            return 0;
        }

        let mut versions = self.versions.write();
        // Chains are ordered by end_ts descending, so reclaimable versions
        // form a suffix. The open version never qualifies.
        let keep = versions
            .iter()
            .position(|v| v.can_gc(horizon))
            .unwrap_or(versions.len());
        let keep = keep.max(versions.len().saturating_sub(budget));

        let freed: u64 = versions[keep..].iter().map(|v| v.size() as u64).sum();
        let removed = versions.len() - keep;
        versions.truncate(keep);
        self.total_size.fetch_sub(freed, AtomicOrdering::Relaxed);
        removed
    }

    /// True if the chain's only version is a tombstone older than `horizon`.
    /// Every snapshot that can still run reads "absent" either way.
    fn is_prunable(&self, horizon: Timestamp) -> bool {
        let versions = self.versions.read();
        match versions.as_slice() {
            [] => true,
            [only] => only.is_tombstone() && only.begin_ts < horizon,
            _ => false,
        }
    }

    /// Returns all retained versions, newest first.
    pub fn all_versions(&self) -> Vec<Version> {
        self.versions.read().clone()
    }
}

/// Writes buffered by one transaction until commit.
///
/// Keys are kept ordered so publication touches chains in a stable order.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    writes: BTreeMap<ResourceId, Option<Value>>,
}

impl WriteSet {
    /// Creates an empty write set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a new value for `resource`, replacing any earlier write.
    pub fn put(&mut self, resource: ResourceId, value: Value) {
        self.writes.insert(resource, Some(value));
    }

    /// Buffers a deletion of `resource`.
    pub fn delete(&mut self, resource: ResourceId) {
        self.writes.insert(resource, None);
    }

    /// Returns the buffered write for `resource`.
    ///
    /// `Some(None)` means the transaction deleted it.
    pub fn get(&self, resource: &ResourceId) -> Option<Option<&Value>> {
        self.writes.get(resource).map(Option::as_ref)
    }

    /// Returns the number of buffered writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Iterates over buffered writes in resource order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, Option<&Value>)> {
        self.writes.iter().map(|(r, v)| (r, v.as_ref()))
    }

    /// Discards all buffered writes.
    pub fn clear(&mut self) {
        self.writes.clear();
    }
}

/// Version ID generator.
#[derive(Debug)]
pub struct VersionIdGenerator {
    next_id: AtomicU64,
}

impl VersionIdGenerator {
    /// Creates a new generator.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Generates the next version ID.
    pub fn next(&self) -> VersionId {
        VersionId::new(self.next_id.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

impl Default for VersionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A store for managing version chains.
///
/// Chains are inserted and removed only while holding their map shard, so a
/// publish can never land in a chain that pruning has just detached.
pub struct VersionStore {
    /// All version chains, indexed by resource.
    chains: DashMap<ResourceId, Arc<VersionChain>>,
    /// Resources whose chains were pruned.
    retired: DashSet<ResourceId>,
    /// Version ID generator.
    id_gen: VersionIdGenerator,
}

impl VersionStore {
    /// Creates a new empty version store.
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            retired: DashSet::new(),
            id_gen: VersionIdGenerator::new(),
        }
    }

    /// Returns the number of resources with a chain.
    pub fn resource_count(&self) -> usize {
        self.chains.len()
    }

    /// Returns the number of retained versions across all chains.
    pub fn version_count(&self) -> usize {
        self.chains.iter().map(|c| c.len()).sum()
    }

    /// Returns the total size of all retained versions.
    pub fn total_size(&self) -> u64 {
        self.chains.iter().map(|c| c.total_size()).sum()
    }

    /// Returns true if `resource` has a chain or had one pruned.
    pub fn has_history(&self, resource: &ResourceId) -> bool {
        self.chains.contains_key(resource) || self.retired.contains(resource)
    }

    /// Gets a version chain if it exists.
    pub fn chain(&self, resource: &ResourceId) -> Option<Arc<VersionChain>> {
        self.chains.get(resource).map(|r| Arc::clone(r.value()))
    }

    /// Returns the value of `resource` as of snapshot `ts`.
    ///
    /// `None` if no version was current at `ts` or the current one is a
    /// deletion. Never blocks on writers.
    pub fn read(&self, resource: &ResourceId, ts: Timestamp) -> Option<Value> {
        self.read_version(resource, ts).and_then(|v| v.value)
    }

    /// Returns the version of `resource` that was current at `ts`.
    pub fn read_version(&self, resource: &ResourceId, ts: Timestamp) -> Option<Version> {
        self.chain(resource).and_then(|chain| chain.read_at(ts))
    }

    /// Returns the latest committed value of `resource`.
    pub fn read_latest(&self, resource: &ResourceId) -> Option<Value> {
        self.chain(resource)
            .and_then(|chain| chain.latest())
            .and_then(|v| v.value)
    }

    /// Returns the commit timestamp of the newest version of `resource`.
    pub fn latest_commit_ts(&self, resource: &ResourceId) -> Option<Timestamp> {
        self.chain(resource).and_then(|chain| chain.latest_commit_ts())
    }

    /// Installs a committed version of `resource` at `commit_ts`.
    ///
    /// Callers serialize installs through the oracle's commit window so
    /// commit timestamps on a chain only grow.
    pub fn install(
        &self,
        resource: ResourceId,
        created_by: TxnId,
        value: Option<Value>,
        commit_ts: Timestamp,
    ) -> VersionId {
        let id = self.id_gen.next();
        let version = Version::new(id, created_by, value, commit_ts);
        // Install while holding the shard so pruning cannot race the insert.
        let entry = self
            .chains
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(VersionChain::new(resource)));
        entry.value().install(version);
        id
    }

    /// First-committer-wins check for a snapshot-isolation commit.
    ///
    /// Fails if any resource in `writes` has a version committed after
    /// `snapshot_ts`.
    pub fn validate(&self, txn_id: TxnId, writes: &WriteSet, snapshot_ts: Timestamp) -> KeelResult<()> {
        for (resource, _) in writes.iter() {
            if let Some(committed_at) = self.latest_commit_ts(resource) {
                if committed_at > snapshot_ts {
                    return Err(KeelError::WriteConflict {
                        txn_id,
                        resource: resource.clone(),
                        committed_at,
                    });
                }
            }
        }
        Ok(())
    }

    /// Publishes every buffered write as a version committed at `commit_ts`.
    /// Returns the number of versions installed.
    pub fn publish(&self, txn_id: TxnId, writes: &WriteSet, commit_ts: Timestamp) -> usize {
        for (resource, value) in writes.iter() {
            self.install(resource.clone(), txn_id, value.cloned(), commit_ts);
        }
        writes.len()
    }

    /// Removes closed versions invisible to every snapshot at or after
    /// `horizon`, up to `budget` versions. Returns the number removed.
    pub fn collect_versions(&self, horizon: Timestamp, budget: usize) -> usize {
        let mut total = 0;
        for chain in self.chains.iter() {
            if total >= budget {
                break;
            }
            total += chain.gc(horizon, budget - total);
        }
        total
    }

    /// Removes chains whose only remaining version is an old deletion.
    /// Returns the number of chains removed.
    pub fn prune_chains(&self, horizon: Timestamp) -> usize {
        let candidates: Vec<ResourceId> = self
            .chains
            .iter()
            .filter(|c| c.is_prunable(horizon))
            .map(|c| c.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|resource| {
                let pruned = self
                    .chains
                    .remove_if(resource, |_, chain| chain.is_prunable(horizon))
                    .is_some();
                if pruned {
                    self.retired.insert(resource.clone());
                }
                pruned
            })
            .count()
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionStore")
            .field("resource_count", &self.resource_count())
            .finish()
    }
}
