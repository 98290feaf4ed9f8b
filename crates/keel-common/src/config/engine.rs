//! Transaction core configuration structures.
//!
//! These structures define all configurable aspects of a Keel instance.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{KeelError, KeelResult};

/// Isolation level selected per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Reads take shared locks and observe the latest committed state.
    Serializable,
    /// Reads observe the snapshot taken at begin and never lock.
    #[default]
    SnapshotIsolation,
}

/// Lock release discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingProtocol {
    /// Locks are held until commit or abort.
    #[default]
    Strict,
    /// Locks may be released early; the first release ends the growing phase.
    Conventional,
}

/// How lock waits that can never be satisfied are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockMode {
    /// Cycle detection on the wait-for graph each time a request blocks.
    #[default]
    Graph,
    /// Any wait longer than `lock_timeout` fails with `LockTimeout`.
    Timeout,
}

/// Grant order for queued lock requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFairness {
    /// Grants stop at the first incompatible waiter and new requests never
    /// bypass a non-empty queue.
    #[default]
    Fifo,
    /// Every compatible request is granted, regardless of queue position.
    /// Writers may starve under a steady stream of readers.
    Greedy,
}

/// Main transaction core configuration.
///
/// # Example
///
/// ```rust
/// use keel_common::config::{CoreConfig, DeadlockMode};
///
/// let config = CoreConfig::default();
/// assert_eq!(config.lock.deadlock_mode, DeadlockMode::Graph);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Isolation level used by `begin()`.
    /// Default: snapshot isolation
    pub default_isolation: Isolation,

    /// Lock release discipline.
    /// Default: strict
    pub locking: LockingProtocol,

    /// Take intention locks on the enclosing table before locking a row or page.
    /// Default: true
    pub hierarchical_locking: bool,

    /// Lock manager configuration.
    pub lock: LockConfig,

    /// Version garbage collection configuration.
    pub gc: GcConfig,

    /// Number of finished transaction outcomes remembered for idempotent
    /// commit/abort.
    /// Default: 4096
    pub finished_retention: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_isolation: Isolation::default(),
            locking: LockingProtocol::default(),
            hierarchical_locking: true,
            lock: LockConfig::default(),
            gc: GcConfig::default(),
            finished_retention: 4096,
        }
    }
}

impl CoreConfig {
    /// Creates a configuration tuned for tests: short timeouts and no
    /// background collector.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            lock: LockConfig {
                lock_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            gc: GcConfig {
                interval: None,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> KeelResult<()> {
        self.lock.validate()?;
        self.gc.validate()?;

        if self.finished_retention == 0 {
            return Err(KeelError::invalid_config(
                "finished_retention must be at least 1",
            ));
        }

        Ok(())
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Deadlock handling strategy.
    /// Default: graph
    pub deadlock_mode: DeadlockMode,

    /// Maximum wait in `timeout` mode.
    /// Default: 1s
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Wait queue grant order.
    /// Default: fifo
    pub fairness: QueueFairness,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            deadlock_mode: DeadlockMode::default(),
            lock_timeout: Duration::from_secs(1),
            fairness: QueueFairness::default(),
        }
    }
}

impl LockConfig {
    /// Validates the lock configuration.
    pub fn validate(&self) -> KeelResult<()> {
        if self.deadlock_mode == DeadlockMode::Timeout && self.lock_timeout.is_zero() {
            return Err(KeelError::invalid_config(
                "lock_timeout must be non-zero in timeout mode",
            ));
        }
        Ok(())
    }

    /// Returns the bound on a single lock wait, if any.
    #[must_use]
    pub fn wait_bound(&self) -> Option<Duration> {
        match self.deadlock_mode {
            DeadlockMode::Graph => None,
            DeadlockMode::Timeout => Some(self.lock_timeout),
        }
    }
}

/// Version garbage collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Interval of the background collector; `None` disables it.
    /// Default: 1s
    #[serde(with = "humantime_serde::option")]
    pub interval: Option<Duration>,

    /// Upper bound on versions reclaimed by one pass.
    /// Default: 10000
    pub max_versions_per_run: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(1)),
            max_versions_per_run: 10_000,
        }
    }
}

impl GcConfig {
    /// Validates the collector configuration.
    pub fn validate(&self) -> KeelResult<()> {
        if self.interval.is_some_and(|interval| interval.is_zero()) {
            return Err(KeelError::invalid_config("gc.interval must be non-zero"));
        }
        if self.max_versions_per_run == 0 {
            return Err(KeelError::invalid_config(
                "gc.max_versions_per_run must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration using humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| humantime::format_duration(d).to_string())
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
