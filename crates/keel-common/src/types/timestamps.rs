//! Logical timestamps for snapshot visibility and commit ordering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical timestamp drawn from the database-wide timestamp oracle.
///
/// Snapshot timestamps and commit timestamps share one counter, so any
/// snapshot taken after a commit orders strictly after that commit.
/// [`Timestamp::MAX`] doubles as the "open" valid-to bound of the current
/// version of a record.
///
/// # Example
///
/// ```rust
/// use keel_common::types::Timestamp;
///
/// let ts = Timestamp::new(10);
/// assert!(ts.next() > ts);
/// assert!(Timestamp::MAX.is_open());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The origin; preloaded versions are valid from here.
    pub const ZERO: Self = Self(0);

    /// Open upper bound.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a timestamp from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following timestamp.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns true if this is the open upper bound.
    #[inline]
    #[must_use]
    pub const fn is_open(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "Timestamp(OPEN)")
        } else {
            write!(f, "Timestamp({})", self.0)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "open")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}
