//! Garbage collection of superseded versions.
//!
//! A closed version is reclaimable once its `end_ts` is below the snapshot
//! timestamp of every active transaction. The horizon is the running minimum
//! kept by the [`SnapshotRegistry`]; with no active transactions it is one
//! past the last timestamp handed out by the oracle.
//!
//! # Key Components
//!
//! - [`GarbageCollector`]: computes the horizon and reclaims versions
//! - [`GcWorker`]: background thread running a collector at a fixed interval
//!
//! # Safety
//!
//! - The open version of a resource is never reclaimed.
//! - The horizon is read inside the oracle's commit window, so no snapshot
//!   below it can be handed out afterwards.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use keel_common::config::GcConfig;
use keel_common::types::Timestamp;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::clock::TimestampOracle;
use crate::snapshot::SnapshotRegistry;
use crate::version::VersionStore;

/// Statistics about garbage collection.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Total number of GC runs.
    pub runs: AtomicU64,
    /// Total versions collected.
    pub versions_collected: AtomicU64,
    /// Total chains pruned.
    pub chains_pruned: AtomicU64,
}

impl GcStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a GC run.
    pub fn record_run(&self, versions: usize, chains: usize) {
        self.runs.fetch_add(1, AtomicOrdering::Relaxed);
        self.versions_collected
            .fetch_add(versions as u64, AtomicOrdering::Relaxed);
        self.chains_pruned
            .fetch_add(chains as u64, AtomicOrdering::Relaxed);
    }

    /// Returns the total number of runs.
    pub fn total_runs(&self) -> u64 {
        self.runs.load(AtomicOrdering::Relaxed)
    }

    /// Returns the total versions collected.
    pub fn total_versions_collected(&self) -> u64 {
        self.versions_collected.load(AtomicOrdering::Relaxed)
    }

    /// Returns the total chains pruned.
    pub fn total_chains_pruned(&self) -> u64 {
        self.chains_pruned.load(AtomicOrdering::Relaxed)
    }
}

/// Result of a garbage collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcResult {
    /// Horizon used for this run.
    pub horizon: Timestamp,
    /// Number of versions collected.
    pub versions_collected: usize,
    /// Number of tombstone-only chains pruned.
    pub chains_pruned: usize,
}

impl GcResult {
    /// Returns true if any work was done.
    pub fn did_work(&self) -> bool {
        self.versions_collected > 0 || self.chains_pruned > 0
    }
}

/// Reclaims versions no active snapshot can observe.
pub struct GarbageCollector {
    store: Arc<VersionStore>,
    snapshots: Arc<SnapshotRegistry>,
    oracle: Arc<TimestampOracle>,
    config: GcConfig,
    stats: GcStats,
}

impl GarbageCollector {
    /// Creates a new garbage collector.
    pub fn new(
        store: Arc<VersionStore>,
        snapshots: Arc<SnapshotRegistry>,
        oracle: Arc<TimestampOracle>,
    ) -> Self {
        Self::with_config(store, snapshots, oracle, GcConfig::default())
    }

    /// Creates a garbage collector with custom configuration.
    pub fn with_config(
        store: Arc<VersionStore>,
        snapshots: Arc<SnapshotRegistry>,
        oracle: Arc<TimestampOracle>,
        config: GcConfig,
    ) -> Self {
        Self {
            store,
            snapshots,
            oracle,
            config,
            stats: GcStats::new(),
        }
    }

    /// Returns the oldest timestamp any current or future snapshot can have.
    pub fn horizon(&self) -> Timestamp {
        let window = self.oracle.commit_window();
        self.snapshots
            .min_active()
            .unwrap_or_else(|| window.current().next())
    }

    /// Runs one collection pass.
    pub fn collect_once(&self) -> GcResult {
        let started = Instant::now();
        let horizon = self.horizon();

        let versions_collected = self
            .store
            .collect_versions(horizon, self.config.max_versions_per_run);
        let chains_pruned = self.store.prune_chains(horizon);
        self.stats.record_run(versions_collected, chains_pruned);

        let result = GcResult {
            horizon,
            versions_collected,
            chains_pruned,
        };
        if result.did_work() {
            info!(
                horizon = %horizon,
                versions = versions_collected,
                chains = chains_pruned,
                elapsed_us = started.elapsed().as_micros() as u64,
                "garbage collection reclaimed versions"
            );
        }
        result
    }

    /// Returns GC statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Returns the configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("total_runs", &self.stats.total_runs())
            .field("total_collected", &self.stats.total_versions_collected())
            .finish()
    }
}

/// Stop signal shared with the worker thread.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// Background thread that runs a [`GarbageCollector`] periodically.
///
/// The thread exits when [`GcWorker::stop`] is called or the worker is
/// dropped.
pub struct GcWorker {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    /// Starts a worker that calls `collect_once` every `interval`.
    pub fn spawn(collector: Arc<GarbageCollector>, interval: Duration) -> Self {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);

        let handle = thread::spawn(move || {
            debug!(interval_ms = interval.as_millis() as u64, "gc worker started");
            loop {
                {
                    let mut stopped = thread_signal.stopped.lock();
                    if !*stopped {
                        thread_signal.wakeup.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                collector.collect_once();
            }
            debug!("gc worker stopped");
        });

        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Stops the worker and waits for the thread to exit.
    pub fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Returns true while the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for GcWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcWorker")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use keel_common::types::{ResourceId, TxnId};

    struct Fixture {
        oracle: Arc<TimestampOracle>,
        snapshots: Arc<SnapshotRegistry>,
        store: Arc<VersionStore>,
        collector: Arc<GarbageCollector>,
    }

    fn fixture() -> Fixture {
        let oracle = Arc::new(TimestampOracle::new());
        let snapshots = Arc::new(SnapshotRegistry::new());
        let store = Arc::new(VersionStore::new());
        let collector = Arc::new(GarbageCollector::new(
            Arc::clone(&store),
            Arc::clone(&snapshots),
            Arc::clone(&oracle),
        ));
        Fixture {
            oracle,
            snapshots,
            store,
            collector,
        }
    }

    fn commit(f: &Fixture, resource: &ResourceId, value: Option<&'static str>) -> Timestamp {
        let window = f.oracle.commit_window();
        let ts = window.commit_timestamp();
        f.store.install(
            resource.clone(),
            TxnId::new(ts.as_u64()),
            value.map(|v| Bytes::from_static(v.as_bytes())),
            ts,
        );
        ts
    }

    #[test]
    fn test_gc_stats() {
        let stats = GcStats::new();
        stats.record_run(10, 2);
        stats.record_run(5, 1);
        assert_eq!(stats.total_runs(), 2);
        assert_eq!(stats.total_versions_collected(), 15);
        assert_eq!(stats.total_chains_pruned(), 3);
    }

    #[test]
    fn test_horizon_without_active() {
        let f = fixture();
        let r = ResourceId::row(1, "k");
        commit(&f, &r, Some("a"));
        commit(&f, &r, Some("b"));

        assert_eq!(f.collector.horizon(), Timestamp::new(3));
        let result = f.collector.collect_once();
        assert_eq!(result.versions_collected, 1);
        assert_eq!(f.store.read_latest(&r), Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn test_active_snapshot_pins_versions() {
        let f = fixture();
        let r = ResourceId::row(1, "k");
        commit(&f, &r, Some("a"));

        let reader = f.snapshots.open(&f.oracle, TxnId::new(100));
        commit(&f, &r, Some("b"));
        commit(&f, &r, Some("c"));

        let result = f.collector.collect_once();
        assert_eq!(result.horizon, reader.read_ts());
        // "a" is still the reader's version and "b" ended after it began.
        assert_eq!(result.versions_collected, 0);
        assert_eq!(
            f.store.read(&r, reader.read_ts()),
            Some(Bytes::from_static(b"a"))
        );

        f.snapshots.unregister(&reader);
        let result = f.collector.collect_once();
        assert_eq!(result.versions_collected, 2);
        assert_eq!(f.store.version_count(), 1);
    }

    #[test]
    fn test_gc_prunes_deleted_resources() {
        let f = fixture();
        let r = ResourceId::row(1, "gone");
        commit(&f, &r, Some("a"));
        commit(&f, &r, None);

        let result = f.collector.collect_once();
        assert!(result.did_work());
        assert_eq!(result.versions_collected, 1);
        assert_eq!(result.chains_pruned, 1);
        assert_eq!(f.store.resource_count(), 0);
        assert_eq!(f.collector.stats().total_chains_pruned(), 1);
    }

    #[test]
    fn test_gc_respects_budget() {
        let f = fixture();
        let config = GcConfig {
            interval: None,
            max_versions_per_run: 2,
        };
        let collector = GarbageCollector::with_config(
            Arc::clone(&f.store),
            Arc::clone(&f.snapshots),
            Arc::clone(&f.oracle),
            config,
        );

        let r = ResourceId::row(1, "k");
        for _ in 0..6 {
            commit(&f, &r, Some("x"));
        }

        assert_eq!(collector.collect_once().versions_collected, 2);
        assert_eq!(collector.collect_once().versions_collected, 2);
        assert_eq!(collector.collect_once().versions_collected, 1);
        assert!(!collector.collect_once().did_work());
    }

    #[test]
    fn test_worker_runs_and_stops() {
        let f = fixture();
        let r = ResourceId::row(1, "k");
        commit(&f, &r, Some("a"));
        commit(&f, &r, Some("b"));

        let mut worker = GcWorker::spawn(Arc::clone(&f.collector), Duration::from_millis(5));
        assert!(worker.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.store.version_count() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(f.store.version_count(), 1);

        worker.stop();
        assert!(!worker.is_running());
        let runs = f.collector.stats().total_runs();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(f.collector.stats().total_runs(), runs);
    }
}
