//! Lock manager behavior under real thread contention.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keel_common::config::{CoreConfig, DeadlockMode, Isolation, LockConfig};
use keel_common::error::KeelError;
use keel_common::types::{ResourceId, TxnId};
use keel_test::utils::{encode_i64, init_tracing, wait_for};
use keel_test::workload::run_transaction;
use keel_txn::{LockManager, LockMode, LockResult, TransactionManager};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

#[test]
fn test_exclusive_lock_mutual_exclusion() {
    init_tracing();
    let locks = Arc::new(LockManager::new());
    let resource = ResourceId::row(1, "hot");
    let inside = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6u64)
        .map(|worker| {
            let locks = Arc::clone(&locks);
            let resource = resource.clone();
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            thread::spawn(move || {
                for round in 0..25u64 {
                    let txn = TxnId::new(1 + worker * 1_000 + round);
                    locks.register(txn);
                    locks.acquire(txn, &resource, LockMode::Exclusive).unwrap();

                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entries.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);

                    assert_eq!(locks.close(txn), 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(entries.load(Ordering::Relaxed), 150);
    assert_eq!(locks.lock_count(), 0);
    assert_eq!(locks.txn_count(), 0);
}

fn assert_pairwise_compatible(holders: &[(TxnId, LockMode)]) {
    for (i, (a, held_a)) in holders.iter().enumerate() {
        for (b, held_b) in &holders[i + 1..] {
            assert!(
                held_a.is_compatible_with(held_b),
                "{a} holds {held_a} alongside {b} holding {held_b}"
            );
        }
    }
}

#[test]
fn test_granted_modes_stay_compatible() {
    init_tracing();
    let locks = Arc::new(LockManager::new());
    let table = ResourceId::table(4);
    let done = Arc::new(AtomicBool::new(false));

    let auditor = {
        let locks = Arc::clone(&locks);
        let table = table.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut audits = 0usize;
            while !done.load(Ordering::Acquire) {
                assert_pairwise_compatible(&locks.holders(&table));
                audits += 1;
                thread::yield_now();
            }
            audits
        })
    };

    let granted = Arc::new(Mutex::new([0usize; 5]));
    let workers: Vec<_> = (0..6u64)
        .map(|worker| {
            let locks = Arc::clone(&locks);
            let table = table.clone();
            let granted = Arc::clone(&granted);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE + worker);
                for round in 0..40u64 {
                    let txn = TxnId::new(1 + worker * 1_000 + round);
                    let index = rng.gen_range(0..LockMode::ALL.len());
                    let mode = LockMode::ALL[index];
                    locks.register(txn);
                    locks.acquire(txn, &table, mode).unwrap();

                    assert_eq!(locks.held_mode(txn, &table), Some(mode));
                    assert_pairwise_compatible(&locks.holders(&table));
                    granted.lock()[index] += 1;
                    thread::yield_now();

                    assert_eq!(locks.close(txn), 1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(auditor.join().unwrap() > 0);

    assert_eq!(granted.lock().iter().sum::<usize>(), 240);
    assert!(granted.lock().iter().all(|count| *count > 0));
    assert_eq!(locks.lock_count(), 0);
    assert_eq!(locks.detector().graph().edge_count(), 0);
}

#[test]
fn test_readers_share_writer_excludes() {
    init_tracing();
    let locks = Arc::new(LockManager::new());
    let resource = ResourceId::row(1, "doc");
    for n in 1..=4 {
        locks.register(TxnId::new(n));
    }
    for n in 1..=3 {
        locks
            .acquire(TxnId::new(n), &resource, LockMode::Shared)
            .unwrap();
    }
    assert_eq!(locks.holders(&resource).len(), 3);

    let writer = {
        let locks = Arc::clone(&locks);
        let resource = resource.clone();
        thread::spawn(move || locks.acquire(TxnId::new(4), &resource, LockMode::Exclusive))
    };
    assert!(wait_for(Duration::from_secs(5), || locks
        .is_waiting(TxnId::new(4))));

    for n in 1..=3 {
        assert!(locks.release(TxnId::new(n), &resource));
    }
    writer.join().unwrap().unwrap();
    assert_eq!(
        locks.holders(&resource),
        vec![(TxnId::new(4), LockMode::Exclusive)]
    );
}

#[test]
fn test_writer_not_starved_by_later_readers() {
    init_tracing();
    let locks = LockManager::new();
    let resource = ResourceId::row(1, "k");
    let (t1, t2, t3) = (TxnId::new(1), TxnId::new(2), TxnId::new(3));
    for txn in [t1, t2, t3] {
        locks.register(txn);
    }

    locks.acquire(t1, &resource, LockMode::Shared).unwrap();
    assert_eq!(
        locks.request(t2, &resource, LockMode::Exclusive).unwrap(),
        LockResult::Blocked
    );
    // Compatible with the holder, but queued behind the writer.
    assert_eq!(
        locks.request(t3, &resource, LockMode::Shared).unwrap(),
        LockResult::Blocked
    );

    locks.release(t1, &resource);
    assert_eq!(locks.held_mode(t2, &resource), Some(LockMode::Exclusive));
    assert!(locks.is_waiting(t3));
    locks.wait(t2, &resource).unwrap();

    locks.close(t2);
    locks.wait(t3, &resource).unwrap();
    assert_eq!(locks.held_mode(t3, &resource), Some(LockMode::Shared));
}

#[test]
fn test_lock_timeout_mode() {
    init_tracing();
    let config = CoreConfig {
        lock: LockConfig {
            deadlock_mode: DeadlockMode::Timeout,
            lock_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        ..CoreConfig::for_testing()
    };
    let tm = TransactionManager::with_config(config).unwrap();
    let row = ResourceId::row(1, "k");

    let t1 = tm.begin().unwrap();
    let t2 = tm.begin().unwrap();
    tm.write(t1, row.clone(), encode_i64(1)).unwrap();

    let err = tm.write(t2, row.clone(), encode_i64(2)).unwrap_err();
    assert!(matches!(err, KeelError::LockTimeout { .. }));
    assert!(err.is_retryable());
    assert!(matches!(
        tm.read(t2, &row),
        Err(KeelError::TransactionAborted { .. })
    ));

    tm.commit(t1).unwrap();
    assert_eq!(tm.lock_manager().stats().timeouts.load(Ordering::Relaxed), 1);
}

#[test]
fn test_deadlock_storm_completes() {
    init_tracing();
    let tm = Arc::new(TransactionManager::with_config(CoreConfig::for_testing()).unwrap());
    let rows: Vec<ResourceId> = (0..4).map(|n| ResourceId::row(9, vec![n as u8])).collect();
    let victims = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..6u64)
        .map(|worker| {
            let tm = Arc::clone(&tm);
            let rows = rows.clone();
            let victims = Arc::clone(&victims);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for round in 0..20i64 {
                    let mut order = rows.clone();
                    order.shuffle(&mut rng);
                    let done = run_transaction(&tm, Isolation::Serializable, 10_000, |txn| {
                        for row in &order {
                            tm.write(txn, row.clone(), encode_i64(round))?;
                        }
                        Ok(())
                    })
                    .unwrap();
                    victims.lock().push(done.attempts - 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(victims.lock().len(), 120);
    assert_eq!(tm.active_count(), 0);
    assert_eq!(tm.lock_manager().lock_count(), 0);
    assert_eq!(tm.lock_manager().detector().graph().edge_count(), 0);
    let stats = tm.stats();
    assert_eq!(stats.committed.load(Ordering::Relaxed), 120);
    assert_eq!(
        stats.aborted.load(Ordering::Relaxed),
        victims.lock().iter().sum::<usize>() as u64
    );
}
