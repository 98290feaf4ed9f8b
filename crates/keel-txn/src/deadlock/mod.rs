//! Deadlock detection using wait-for graph analysis.
//!
//! This module implements deadlock detection for the lock manager:
//! - Wait-for graph (WFG) keyed by transaction ID, with no pointers between
//!   transaction records
//! - Incremental cycle detection: a DFS from the newly blocked transaction
//! - Pluggable victim selection behind [`VictimSelector`]
//!
//! # Wait-For Graph
//!
//! The WFG tracks which transactions are waiting for which:
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T3:  T2 -> T3
//! T3 waits for T1:  T3 -> T1 (cycle = deadlock!)
//! ```
//!
//! A transaction waits on at most one resource at a time, so the graph
//! stores one [`WaitEntry`] per waiter: the resource, the requested mode and
//! the set of transactions blocking it. The lock manager rewrites a waiter's
//! entry whenever the state of its resource changes.
//!
//! # Deadlock Resolution
//!
//! When a deadlock is detected, one member of the cycle must be aborted.
//! The default policy ([`FewestLocksYoungest`]):
//! 1. Prefer the transaction holding the fewest locks (cheapest rollback)
//! 2. Break ties by choosing the youngest (highest) transaction ID

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use keel_common::types::{ResourceId, TxnId};
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::lock::LockMode;

/// A single wait-for edge: `waiter` is blocked by `blocker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEdge {
    /// The blocked transaction.
    pub waiter: TxnId,
    /// The transaction it waits for.
    pub blocker: TxnId,
    /// The resource the waiter requested.
    pub resource: ResourceId,
    /// The mode the waiter requested.
    pub mode: LockMode,
}

/// What one blocked transaction is waiting for.
#[derive(Debug, Clone)]
pub struct WaitEntry {
    /// The resource it requested.
    pub resource: ResourceId,
    /// The requested mode.
    pub mode: LockMode,
    /// Transactions it waits for.
    pub blockers: BTreeSet<TxnId>,
}

/// The wait-for graph.
///
/// Plain data; callers serialize access through [`DeadlockDetector::graph`].
#[derive(Debug, Default)]
pub struct WaitForGraph {
    waits: HashMap<TxnId, WaitEntry>,
}

impl WaitForGraph {
    /// Creates a new empty wait-for graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the edges of `waiter`.
    ///
    /// An empty blocker set removes the waiter. Returns true if the new set
    /// contains a blocker the old one did not, i.e. a cycle may have formed.
    pub fn set_waits(
        &mut self,
        waiter: TxnId,
        resource: ResourceId,
        mode: LockMode,
        blockers: impl IntoIterator<Item = TxnId>,
    ) -> bool {
        let blockers: BTreeSet<TxnId> = blockers.into_iter().filter(|b| *b != waiter).collect();
        if blockers.is_empty() {
            self.waits.remove(&waiter);
            return false;
        }

        let grew = match self.waits.get(&waiter) {
            Some(old) if old.resource == resource => !blockers.is_subset(&old.blockers),
            _ => true,
        };
        self.waits.insert(
            waiter,
            WaitEntry {
                resource,
                mode,
                blockers,
            },
        );
        grew
    }

    /// Adds a single wait-for edge.
    pub fn add_wait(&mut self, waiter: TxnId, blocker: TxnId, resource: ResourceId, mode: LockMode) {
        if waiter == blocker {
            return;
        }
        let entry = self.waits.entry(waiter).or_insert_with(|| WaitEntry {
            resource: resource.clone(),
            mode,
            blockers: BTreeSet::new(),
        });
        if entry.resource != resource {
            entry.resource = resource;
            entry.blockers.clear();
        }
        entry.mode = mode;
        entry.blockers.insert(blocker);
    }

    /// Clears all waits for a transaction.
    pub fn clear_waits(&mut self, waiter: TxnId) {
        self.waits.remove(&waiter);
    }

    /// Removes a transaction and every edge pointing at it.
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.waits.remove(&txn_id);
        self.waits.retain(|_, entry| {
            entry.blockers.remove(&txn_id);
            !entry.blockers.is_empty()
        });
    }

    /// Returns what a transaction is waiting for.
    pub fn get_waits(&self, waiter: TxnId) -> Vec<TxnId> {
        self.waits
            .get(&waiter)
            .map(|e| e.blockers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the wait entry of a transaction.
    pub fn entry(&self, waiter: TxnId) -> Option<&WaitEntry> {
        self.waits.get(&waiter)
    }

    /// Checks if a transaction is waiting.
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.waits.contains_key(&txn_id)
    }

    /// Returns the number of waiting transactions.
    pub fn waiter_count(&self) -> usize {
        self.waits.len()
    }

    /// Returns the number of wait edges.
    pub fn edge_count(&self) -> usize {
        self.waits.values().map(|e| e.blockers.len()).sum()
    }

    /// Returns every edge in the graph, ordered by waiter then blocker.
    pub fn edges(&self) -> Vec<WaitEdge> {
        let mut edges: Vec<WaitEdge> = self
            .waits
            .iter()
            .flat_map(|(&waiter, entry)| {
                entry.blockers.iter().map(move |&blocker| WaitEdge {
                    waiter,
                    blocker,
                    resource: entry.resource.clone(),
                    mode: entry.mode,
                })
            })
            .collect();
        edges.sort_by_key(|e| (e.waiter, e.blocker));
        edges
    }

    fn successors(&self, txn_id: TxnId) -> std::vec::IntoIter<TxnId> {
        self.get_waits(txn_id).into_iter()
    }

    /// Searches for a path from `start` back to itself.
    ///
    /// Returns the members of the cycle in wait order, starting with
    /// `start`: each member waits for the next and the last waits for
    /// `start`. Runs in O(V + E).
    pub fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        if !self.is_waiting(start) {
            return None;
        }

        let mut visited = HashSet::from([start]);
        let mut path = vec![start];
        let mut stack = vec![self.successors(start)];

        while let Some(frontier) = stack.last_mut() {
            match frontier.next() {
                Some(next) if next == start => return Some(path),
                Some(next) => {
                    if visited.insert(next) {
                        path.push(next);
                        stack.push(self.successors(next));
                    }
                }
                None => {
                    stack.pop();
                    path.pop();
                }
            }
        }

        None
    }

    /// Finds one cycle per group of deadlocked transactions.
    ///
    /// Used for diagnostics; the lock manager relies on [`find_cycle`]
    /// from each newly blocked transaction.
    ///
    /// [`find_cycle`]: WaitForGraph::find_cycle
    pub fn detect_all(&self) -> Vec<Vec<TxnId>> {
        let mut waiters: Vec<TxnId> = self.waits.keys().copied().collect();
        waiters.sort();

        let mut cycles = Vec::new();
        let mut already_found = HashSet::new();
        for waiter in waiters {
            if already_found.contains(&waiter) {
                continue;
            }
            if let Some(cycle) = self.find_cycle(waiter) {
                already_found.extend(cycle.iter().copied());
                cycles.push(cycle);
            }
        }
        cycles
    }
}

/// A cycle member as seen by victim selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleMember {
    /// Transaction ID.
    pub txn_id: TxnId,
    /// Number of locks it currently holds.
    pub locks_held: usize,
}

/// Chooses which member of a deadlock cycle to abort.
pub trait VictimSelector: Send + Sync {
    /// Returns the victim. `cycle` is never empty.
    fn select_victim(&self, cycle: &[CycleMember]) -> TxnId;
}

/// Fewest locks held first, youngest transaction on ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct FewestLocksYoungest;

impl VictimSelector for FewestLocksYoungest {
    fn select_victim(&self, cycle: &[CycleMember]) -> TxnId {
        cycle
            .iter()
            .min_by_key(|m| (m.locks_held, Reverse(m.txn_id)))
            .map_or(TxnId::INVALID, |m| m.txn_id)
    }
}

/// Result of deadlock detection.
#[derive(Debug, Clone)]
pub struct DeadlockInfo {
    /// The cycle of transactions involved.
    pub cycle: Vec<TxnId>,
    /// The selected victim to abort.
    pub victim: TxnId,
    /// When the deadlock was detected.
    pub detected_at: Instant,
}

/// Statistics about deadlock detection.
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Number of detection checks performed.
    pub checks: AtomicU64,
    /// Number of deadlocks found.
    pub deadlocks_found: AtomicU64,
    /// Number of victims selected.
    pub victims_selected: AtomicU64,
}

impl DeadlockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of checks performed.
    pub fn total_checks(&self) -> u64 {
        self.checks.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of deadlocks found.
    pub fn total_deadlocks(&self) -> u64 {
        self.deadlocks_found.load(AtomicOrdering::Relaxed)
    }
}

/// Owns the wait-for graph and the victim policy.
///
/// The graph sits behind a single mutex. The lock manager only takes it
/// while already holding a resource guard, never the other way around.
pub struct DeadlockDetector {
    graph: Mutex<WaitForGraph>,
    selector: Box<dyn VictimSelector>,
    stats: DeadlockStats,
}

impl DeadlockDetector {
    /// Creates a detector with the default victim policy.
    pub fn new() -> Self {
        Self::with_selector(Box::new(FewestLocksYoungest))
    }

    /// Creates a detector with a custom victim policy.
    pub fn with_selector(selector: Box<dyn VictimSelector>) -> Self {
        Self {
            graph: Mutex::new(WaitForGraph::new()),
            selector,
            stats: DeadlockStats::new(),
        }
    }

    /// Locks the wait-for graph.
    pub fn graph(&self) -> MutexGuard<'_, WaitForGraph> {
        self.graph.lock()
    }

    /// Searches for a cycle through `start` and, if one exists, selects a
    /// victim.
    ///
    /// `locks_held` is consulted after the graph guard has been released.
    pub fn check(
        &self,
        start: TxnId,
        locks_held: impl Fn(TxnId) -> usize,
    ) -> Option<DeadlockInfo> {
        self.stats.checks.fetch_add(1, AtomicOrdering::Relaxed);

        let cycle = self.graph.lock().find_cycle(start)?;
        self.stats
            .deadlocks_found
            .fetch_add(1, AtomicOrdering::Relaxed);

        let members: Vec<CycleMember> = cycle
            .iter()
            .map(|&txn_id| CycleMember {
                txn_id,
                locks_held: locks_held(txn_id),
            })
            .collect();
        let victim = self.selector.select_victim(&members);
        self.stats
            .victims_selected
            .fetch_add(1, AtomicOrdering::Relaxed);

        warn!(
            victim = %victim,
            cycle = ?cycle,
            "deadlock detected"
        );

        Some(DeadlockInfo {
            cycle,
            victim,
            detected_at: Instant::now(),
        })
    }

    /// Runs a full detection pass without resolving anything.
    pub fn detect_all(&self) -> Vec<Vec<TxnId>> {
        self.graph.lock().detect_all()
    }

    /// Returns statistics.
    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.graph.lock();
        f.debug_struct("DeadlockDetector")
            .field("waiter_count", &graph.waiter_count())
            .field("edge_count", &graph.edge_count())
            .finish()
    }
}
