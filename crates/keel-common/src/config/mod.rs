//! Configuration for Keel.
//!
//! This module provides configuration structures for the lock manager,
//! deadlock handling and version garbage collection.

mod engine;

pub use engine::{
    CoreConfig, DeadlockMode, GcConfig, Isolation, LockConfig, LockingProtocol, QueueFairness,
};
