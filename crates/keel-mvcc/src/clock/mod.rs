//! Timestamp oracle.
//!
//! A single monotonic counter hands out both snapshot timestamps (at
//! transaction begin) and commit timestamps. Commits allocate their
//! timestamp and publish their versions inside a [`CommitWindow`], which
//! holds the oracle's publish guard; snapshots are drawn under the same
//! guard. Therefore:
//!
//! - a snapshot taken before a commit's window is smaller than its commit
//!   timestamp and never sees its versions;
//! - a snapshot taken after the window closed is larger and sees all of them.
//!
//! ```text
//!   begin(T1) ──▶ ts=10
//!   begin(T2) ──▶ ts=11
//!   commit(T2):  [ window: ts=12, install versions ]
//!   begin(T3) ──▶ ts=13     (observes T2's writes, T1 does not)
//! ```
//!
//! Only the publish step is serialized; the rest of a transaction's work
//! runs concurrently.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use keel_common::constants::FIRST_TIMESTAMP;
use keel_common::types::Timestamp;

/// Issues monotonically increasing logical timestamps.
pub struct TimestampOracle {
    /// Last timestamp handed out.
    last: AtomicU64,
    /// Serializes commit windows and snapshot allocation.
    publish: Mutex<()>,
}

impl TimestampOracle {
    /// Creates an oracle whose first timestamp is `FIRST_TIMESTAMP`.
    pub fn new() -> Self {
        Self::starting_at(FIRST_TIMESTAMP)
    }

    /// Creates an oracle whose first issued timestamp is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            last: AtomicU64::new(first.saturating_sub(1)),
            publish: Mutex::new(()),
        }
    }

    /// Assigns a snapshot timestamp: the read-visibility horizon of a new
    /// transaction.
    pub fn begin_snapshot(&self) -> Timestamp {
        self.begin_snapshot_with(|ts| ts)
    }

    /// Assigns a snapshot timestamp and runs `register` with it before any
    /// commit window can open. Used to publish the snapshot to the
    /// garbage-collection horizon atomically with its allocation.
    pub fn begin_snapshot_with<R>(&self, register: impl FnOnce(Timestamp) -> R) -> R {
        let _guard = self.publish.lock();
        register(self.issue())
    }

    /// Opens a commit window. Only one window is open at a time.
    pub fn commit_window(&self) -> CommitWindow<'_> {
        CommitWindow {
            _guard: self.publish.lock(),
            oracle: self,
        }
    }

    /// Returns the last timestamp handed out.
    pub fn current(&self) -> Timestamp {
        Timestamp::new(self.last.load(AtomicOrdering::Acquire))
    }

    fn issue(&self) -> Timestamp {
        Timestamp::new(self.last.fetch_add(1, AtomicOrdering::AcqRel) + 1)
    }
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimestampOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimestampOracle")
            .field("current", &self.current())
            .finish()
    }
}

/// Exclusive section in which a commit validates and publishes its versions.
///
/// Dropping the window makes room for the next commit and for new snapshots.
pub struct CommitWindow<'a> {
    _guard: MutexGuard<'a, ()>,
    oracle: &'a TimestampOracle,
}

impl CommitWindow<'_> {
    /// Allocates the commit timestamp.
    pub fn commit_timestamp(&self) -> Timestamp {
        self.oracle.issue()
    }

    /// Returns the last timestamp handed out.
    pub fn current(&self) -> Timestamp {
        self.oracle.current()
    }
}

impl fmt::Debug for CommitWindow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitWindow")
            .field("current", &self.oracle.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_oracle_monotonic() {
        let oracle = TimestampOracle::new();
        assert_eq!(oracle.current(), Timestamp::ZERO);

        let a = oracle.begin_snapshot();
        let b = oracle.begin_snapshot();
        assert_eq!(a, Timestamp::new(1));
        assert!(b > a);
        assert_eq!(oracle.current(), b);
    }

    #[test]
    fn test_commit_window_orders_with_snapshots() {
        let oracle = TimestampOracle::starting_at(10);
        let t1 = oracle.begin_snapshot();
        let t2 = oracle.begin_snapshot();

        let commit_ts = {
            let window = oracle.commit_window();
            window.commit_timestamp()
        };
        let t3 = oracle.begin_snapshot();

        assert_eq!(t1, Timestamp::new(10));
        assert_eq!(t2, Timestamp::new(11));
        assert_eq!(commit_ts, Timestamp::new(12));
        assert_eq!(t3, Timestamp::new(13));
    }

    #[test]
    fn test_oracle_concurrent_access() {
        let oracle = Arc::new(TimestampOracle::new());
        let mut handles = vec![];

        for i in 0..8 {
            let oracle = Arc::clone(&oracle);
            handles.push(thread::spawn(move || {
                let mut stamps = vec![];
                for _ in 0..100 {
                    if i % 2 == 0 {
                        stamps.push(oracle.begin_snapshot());
                    } else {
                        stamps.push(oracle.commit_window().commit_timestamp());
                    }
                }
                stamps
            }));
        }

        let mut all = vec![];
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        let len_before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), len_before, "timestamps must be unique");
        assert_eq!(oracle.current(), Timestamp::new(800));
    }
}
