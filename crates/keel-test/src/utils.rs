//! Test utilities.

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use keel_common::types::Value;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a tracing subscriber that writes through the test harness.
///
/// The filter comes from `RUST_LOG` and defaults to warnings from the Keel
/// crates. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("keel_txn=warn,keel_mvcc=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Encodes an integer as a row value.
pub fn encode_i64(n: i64) -> Value {
    Value::from(n.to_string())
}

/// Decodes a row value written by [`encode_i64`].
pub fn decode_i64(value: &Value) -> Option<i64> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// Polls `condition` until it holds or `timeout` elapses. Returns whether
/// it held.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encoding() {
        assert_eq!(decode_i64(&encode_i64(-42)), Some(-42));
        assert_eq!(decode_i64(&Value::from_static(b"nope")), None);
    }

    #[test]
    fn test_wait_for() {
        let mut calls = 0;
        assert!(wait_for(Duration::from_secs(1), || {
            calls += 1;
            calls == 3
        }));
        assert!(!wait_for(Duration::from_millis(5), || false));
    }
}
