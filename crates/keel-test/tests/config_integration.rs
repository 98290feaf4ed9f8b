//! Configuration loading and validation through the transaction manager.

use std::time::Duration;

use keel_common::config::{CoreConfig, DeadlockMode, Isolation, LockingProtocol, QueueFairness};
use keel_common::error::KeelError;
use keel_txn::TransactionManager;

#[test]
fn test_config_json_roundtrip() {
    let mut config = CoreConfig::for_testing();
    config.default_isolation = Isolation::Serializable;
    config.lock.fairness = QueueFairness::Greedy;

    let json = serde_json::to_string_pretty(&config).unwrap();
    assert!(json.contains("\"lock_timeout\": \"200ms\""));
    assert!(json.contains("\"interval\": null"));

    let parsed: CoreConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.default_isolation, Isolation::Serializable);
    assert_eq!(parsed.lock.fairness, QueueFairness::Greedy);
    assert_eq!(parsed.lock.lock_timeout, Duration::from_millis(200));
    assert_eq!(parsed.gc.interval, None);
}

#[test]
fn test_partial_config_uses_defaults() {
    let json = r#"{
        "locking": "conventional",
        "lock": { "deadlock_mode": "timeout", "lock_timeout": "1s 500ms" },
        "gc": { "interval": "250ms" }
    }"#;
    let config: CoreConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.locking, LockingProtocol::Conventional);
    assert_eq!(config.lock.deadlock_mode, DeadlockMode::Timeout);
    assert_eq!(config.lock.lock_timeout, Duration::from_millis(1_500));
    assert_eq!(config.lock.fairness, QueueFairness::Fifo);
    assert_eq!(config.gc.interval, Some(Duration::from_millis(250)));
    assert_eq!(config.gc.max_versions_per_run, 10_000);
    assert_eq!(config.default_isolation, Isolation::SnapshotIsolation);
    assert!(config.hierarchical_locking);

    let tm = TransactionManager::with_config(config).unwrap();
    assert_eq!(tm.config().locking, LockingProtocol::Conventional);
    assert_eq!(tm.shutdown(), 0);
}

#[test]
fn test_invalid_config_rejected() {
    let json = r#"{ "lock": { "deadlock_mode": "timeout", "lock_timeout": "0s" } }"#;
    let config: CoreConfig = serde_json::from_str(json).unwrap();

    let err = TransactionManager::with_config(config).unwrap_err();
    assert!(matches!(err, KeelError::InvalidConfig { .. }));
    assert!(!err.is_retryable());

    let malformed = r#"{ "lock": { "lock_timeout": "soon" } }"#;
    assert!(serde_json::from_str::<CoreConfig>(malformed).is_err());
}
