use std::sync::Arc;
use std::time::Duration;

use fragstore::errors::LockError;
use fragstore::locking::{LockManager, LockType};
use fragstore::transaction::is_older;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn lock_type(rng: &mut StdRng) -> LockType {
    if rng.random_bool(0.5) {
        LockType::Shared
    } else {
        LockType::Exclusive
    }
}

/// Checks the holder list of a resource: either any number of SHARED
/// holders, or exactly one EXCLUSIVE holder.
fn assert_compatible(locks: &LockManager, resource: &str) {
    let holders = locks.holders(resource);
    let exclusive = holders
        .iter()
        .filter(|holder| holder.lock_type == LockType::Exclusive)
        .count();
    assert!(
        exclusive == 0 || holders.len() == 1,
        "incompatible holders on {}: {:?}",
        resource,
        holders
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn randomized_workload_keeps_mutual_exclusion() {
    let locks = Arc::new(LockManager::new(Duration::from_millis(300)));
    let resources = ["tx-a", "tx-b", "tx-c"];
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut timestamps: Vec<u64> = (1..=60).collect();
    timestamps.shuffle(&mut rng);

    let mut tasks = Vec::new();
    for (i, timestamp) in timestamps.into_iter().enumerate() {
        let locks = Arc::clone(&locks);
        let resource = resources[rng.random_range(0..resources.len())];
        let mode = lock_type(&mut rng);
        let hold = Duration::from_millis(rng.random_range(0..5));
        let start_after = Duration::from_millis(rng.random_range(0..40));
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(start_after).await;
            let txn = format!("t{i}");
            let outcome = locks.acquire(resource, &txn, mode, timestamp).await;
            if outcome.is_ok() {
                assert_compatible(&locks, resource);
                tokio::time::sleep(hold).await;
            }
            locks.release(resource, &txn);
            outcome
        }));
    }

    let checker = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            for _ in 0..200 {
                for resource in resources {
                    assert_compatible(&locks, resource);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let mut granted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => granted += 1,
            Err(LockError::Wounded { .. }) | Err(LockError::Timeout { .. }) => {}
            Err(e) => panic!("unexpected lock error: {e}"),
        }
    }
    checker.await.unwrap();
    assert!(granted > 0);
    assert_eq!(locks.resource_count(), 0);
}

#[tokio::test]
async fn younger_never_wounds_older() {
    // Requests arrive one at a time against a single resource. Whoever gets
    // wounded must be younger than the requester, and a requester that
    // meets an older conflicting holder must wait instead.
    let locks = LockManager::new(Duration::from_millis(15));
    let resource = "tx-r";
    let mut rng = StdRng::seed_from_u64(42);
    let mut timestamps: Vec<u64> = (1..=60).collect();
    timestamps.shuffle(&mut rng);

    for (i, timestamp) in timestamps.into_iter().enumerate() {
        let txn = format!("t{i}");
        let mode = lock_type(&mut rng);
        let before = locks.holders(resource);
        let listeners: Vec<_> = before
            .iter()
            .map(|holder| (holder.clone(), locks.wounds().subscribe(&holder.transaction_id)))
            .collect();

        let outcome = locks.acquire(resource, &txn, mode, timestamp).await;

        let older_conflict = before.iter().any(|holder| {
            mode.conflicts_with(holder.lock_type)
                && is_older(holder.timestamp, &holder.transaction_id, timestamp, &txn)
        });
        for (holder, listener) in &listeners {
            if listener.is_wounded() {
                assert!(
                    is_older(timestamp, &txn, holder.timestamp, &holder.transaction_id),
                    "{} (ts={}) wounded older {} (ts={})",
                    txn,
                    timestamp,
                    holder.transaction_id,
                    holder.timestamp
                );
            }
            if older_conflict {
                assert!(!listener.is_wounded());
                assert!(locks.is_held_by(resource, &holder.transaction_id));
            }
        }
        if older_conflict {
            assert!(matches!(outcome, Err(LockError::Timeout { .. })));
        } else {
            assert!(outcome.is_ok());
            assert!(locks.is_held_by(resource, &txn));
            for (holder, listener) in &listeners {
                if mode.conflicts_with(holder.lock_type) {
                    assert!(listener.is_wounded());
                }
            }
        }
        assert_compatible(&locks, resource);

        if i % 7 == 6 {
            for holder in locks.holders(resource) {
                locks.release(resource, &holder.transaction_id);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_requests_are_granted_oldest_first() {
    let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
    let resource = "tx-queue";
    locks
        .acquire(resource, "holder", LockType::Exclusive, 1)
        .await
        .unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut timestamps: Vec<u64> = (10..18).collect();
    timestamps.shuffle(&mut rng);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for timestamp in timestamps {
        let locks = Arc::clone(&locks);
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            let txn = format!("w{timestamp}");
            locks
                .acquire(resource, &txn, LockType::Exclusive, timestamp)
                .await
                .unwrap();
            order.lock().push(timestamp);
            tokio::time::sleep(Duration::from_millis(2)).await;
            locks.release(resource, &txn);
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(locks.queue_len(resource), 8);

    locks.release(resource, "holder");
    for waiter in waiters {
        waiter.await.unwrap();
    }
    let order = order.lock().clone();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);
    assert_eq!(locks.resource_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compatible_newcomer_does_not_jump_the_queue() {
    // 1. "reader" holds SHARED.
    // 2. "writer" (older than the newcomer) queues for EXCLUSIVE.
    // 3. "late" asks for SHARED: compatible with the holder, but must queue
    //    behind the writer.
    const FAIR: &str = "tx-fair";
    let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
    locks
        .acquire(FAIR, "reader", LockType::Shared, 1)
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let spawn = |txn: &'static str, mode: LockType, timestamp: u64| {
        let locks = Arc::clone(&locks);
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            locks.acquire(FAIR, txn, mode, timestamp).await.unwrap();
            order.lock().push(txn);
            tokio::time::sleep(Duration::from_millis(10)).await;
            locks.release(FAIR, txn);
        })
    };

    let writer = spawn("writer", LockType::Exclusive, 5);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let late = spawn("late", LockType::Shared, 10);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(locks.queue_len(FAIR), 2);
    assert!(!locks.is_held_by(FAIR, "late"));

    locks.release(FAIR, "reader");
    writer.await.unwrap();
    late.await.unwrap();
    assert_eq!(*order.lock(), vec!["writer", "late"]);
}

#[tokio::test]
async fn consecutive_shared_requests_are_granted_together() {
    let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
    let resource = "tx-batch";
    locks
        .acquire(resource, "writer", LockType::Exclusive, 1)
        .await
        .unwrap();

    let mut readers = Vec::new();
    for (txn, timestamp) in [("r1", 2), ("r2", 3), ("r3", 4)] {
        let locks = Arc::clone(&locks);
        readers.push(tokio::spawn(async move {
            locks.acquire(resource, txn, LockType::Shared, timestamp).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(locks.queue_len(resource), 3);

    locks.release(resource, "writer");
    for reader in readers {
        reader.await.unwrap().unwrap();
    }
    assert_eq!(locks.holders(resource).len(), 3);
}

#[tokio::test]
async fn wounded_waiter_is_told_so() {
    // "young" holds SHARED and queues an upgrade behind "mid"; "old" then
    // wounds both holders and the queued upgrade is rejected as wounded.
    let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
    let resource = "tx-w";
    locks
        .acquire(resource, "young", LockType::Shared, 30)
        .await
        .unwrap();
    locks
        .acquire(resource, "mid", LockType::Shared, 20)
        .await
        .unwrap();

    let upgrade = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            locks
                .acquire(resource, "young", LockType::Exclusive, 30)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(locks.queue_len(resource), 1);

    locks
        .acquire(resource, "old", LockType::Exclusive, 10)
        .await
        .unwrap();
    let err = upgrade.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        LockError::Wounded {
            transaction_id: "young".to_string()
        }
    );
    assert_eq!(locks.holders(resource).len(), 1);
    assert!(locks.is_held_by(resource, "old"));
}
