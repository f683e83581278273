//! Durability and claim-semantics tests for the SQLite mailstore.
//!
//! Verifies that:
//! - concurrent claimers never double-deliver an event
//! - expired leases are reclaimable and stale holders lose their ack
//! - the retry budget requeues three times, then dead-letters
//! - a reopened store recovers PENDING and expired-CLAIMED events

use std::collections::HashSet;
use std::time::Duration;

use hive_core::event::{EventStatus, NewEvent};
use hive_daemon::mailstore::{MailStore, MailStoreConfig, MailStoreError, MAX_RETRIES};
use serde_json::json;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> MailStore {
    MailStore::open(
        dir.path().join("mailstore.db"),
        MailStoreConfig {
            poll_interval: Duration::from_millis(10),
            ..MailStoreConfig::default()
        },
    )
    .expect("open mailstore")
}

#[test]
fn publish_claim_ack_happy_path() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let id = store
        .publish(
            NewEvent::new("TASK", "producer")
                .with_target("forge")
                .with_payload(json!({"step": 1})),
        )
        .unwrap();

    let event = store
        .claim(
            "worker:forge:1",
            Some("forge"),
            false,
            None,
            Duration::from_millis(200),
        )
        .unwrap()
        .expect("event claimable");
    assert_eq!(event.id, id);
    assert_eq!(event.status, EventStatus::Claimed);

    store
        .ack(id, "worker:forge:1", Some(&json!({"status": "done"})))
        .unwrap();
    let done = store.get_event(id).unwrap().unwrap();
    assert_eq!(done.status, EventStatus::Done);

    // DONE events are never re-emitted.
    assert!(store
        .try_claim("worker:forge:2", Some("forge"), false, None)
        .unwrap()
        .is_none());
}

#[test]
fn concurrent_claimers_deliver_each_event_exactly_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    const EVENTS: usize = 60;
    const CLAIMERS: usize = 4;
    for i in 0..EVENTS {
        store
            .publish(NewEvent::new("TASK", "producer").with_payload(json!({"seq": i})))
            .unwrap();
    }

    let mut handles = Vec::new();
    for claimer in 0..CLAIMERS {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            let consumer_id = format!("worker:bulk:{claimer}");
            let mut acked = Vec::new();
            loop {
                match store.try_claim(&consumer_id, None, true, None).unwrap() {
                    Some(event) => {
                        store.ack(event.id, &consumer_id, None).unwrap();
                        acked.push(event.id);
                    },
                    None => break,
                }
            }
            acked
        }));
    }

    let mut all_acked = Vec::new();
    for handle in handles {
        all_acked.extend(handle.join().unwrap());
    }

    let unique: HashSet<i64> = all_acked.iter().copied().collect();
    assert_eq!(all_acked.len(), EVENTS, "no event lost");
    assert_eq!(unique.len(), EVENTS, "no event delivered twice");

    let counts = store.status_counts().unwrap();
    assert_eq!(counts.get("DONE").copied().unwrap_or(0), EVENTS as u64);
    assert_eq!(counts.get("PENDING").copied().unwrap_or(0), 0);
}

#[test]
fn expired_lease_is_reclaimable_and_stale_ack_fails() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let id = store.publish(NewEvent::new("TASK", "producer")).unwrap();

    let first = store
        .try_claim("worker:first:1", None, true, Some(0.2))
        .unwrap()
        .expect("first claim");
    assert_eq!(first.id, id);

    // Unexpired leases are never evicted.
    assert!(store
        .try_claim("worker:second:1", None, true, None)
        .unwrap()
        .is_none());

    std::thread::sleep(Duration::from_millis(400));

    let second = store
        .try_claim("worker:second:1", None, true, Some(10.0))
        .unwrap()
        .expect("reclaim after expiry");
    assert_eq!(second.id, id);

    let err = store.ack(id, "worker:first:1", None).unwrap_err();
    match err {
        MailStoreError::LeaseLost { holder, .. } => assert_eq!(holder, "worker:second:1"),
        other => panic!("expected LeaseLost, got {other}"),
    }

    store.ack(id, "worker:second:1", None).unwrap();
    assert_eq!(
        store.get_event(id).unwrap().unwrap().status,
        EventStatus::Done
    );
}

#[test]
fn retry_budget_exhaustion_dead_letters() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = store.publish(NewEvent::new("TASK", "producer")).unwrap();

    for _ in 0..MAX_RETRIES {
        let event = store
            .try_claim("worker:a:1", None, true, None)
            .unwrap()
            .expect("still requeued");
        assert_eq!(event.id, id);
        let status = store.fail(id, "worker:a:1", "handler exploded", true).unwrap();
        assert_eq!(status, EventStatus::Pending);
    }

    store.try_claim("worker:a:1", None, true, None).unwrap().unwrap();
    let status = store.fail(id, "worker:a:1", "handler exploded", true).unwrap();
    assert_eq!(status, EventStatus::Dead);

    let dead = store.get_event(id).unwrap().unwrap();
    assert_eq!(dead.status, EventStatus::Dead);
    assert_eq!(dead.retry_count, MAX_RETRIES);
    assert!(store.try_claim("worker:a:1", None, true, None).unwrap().is_none());
}

#[test]
fn fail_without_retry_is_terminal_until_requeued() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = store.publish(NewEvent::new("TASK", "producer")).unwrap();

    store.try_claim("worker:a:1", None, true, None).unwrap().unwrap();
    let status = store.fail(id, "worker:a:1", "boom", false).unwrap();
    assert_eq!(status, EventStatus::Failed);
    assert!(store.try_claim("worker:a:1", None, true, None).unwrap().is_none());
}

#[test]
fn reopened_store_recovers_claimable_events() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("mailstore.db");

    let acked_id;
    let crashed_id;
    let untouched_id;
    {
        let store = MailStore::open(&db_path, MailStoreConfig::default()).unwrap();
        acked_id = store.publish(NewEvent::new("TASK", "producer")).unwrap();
        crashed_id = store.publish(NewEvent::new("TASK", "producer")).unwrap();
        untouched_id = store.publish(NewEvent::new("TASK", "producer")).unwrap();

        // Claim the first available (acked_id) and ack it as done.
        let first = store
            .try_claim("worker:old:1", None, true, Some(0.2))
            .unwrap()
            .unwrap();
        assert_eq!(first.id, acked_id);
        store.ack(first.id, "worker:old:1", None).unwrap();

        // Claim the next with a short lease, then "crash" before acking.
        let second = store
            .try_claim("worker:old:1", None, true, Some(0.2))
            .unwrap()
            .unwrap();
        assert_eq!(second.id, crashed_id);
        // The store handle is dropped with the lease outstanding.
    }

    std::thread::sleep(Duration::from_millis(400));

    let store = MailStore::open(&db_path, MailStoreConfig::default()).unwrap();
    let mut recovered = Vec::new();
    while let Some(event) = store.try_claim("worker:new:1", None, true, None).unwrap() {
        store.ack(event.id, "worker:new:1", None).unwrap();
        recovered.push(event.id);
    }

    // The expired-claim and the never-claimed events come back, in id
    // order; the DONE event does not.
    assert_eq!(recovered, vec![crashed_id, untouched_id]);
    assert!(!recovered.contains(&acked_id));
}

#[test]
fn ids_are_strictly_monotonic_across_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("mailstore.db");

    let first = {
        let store = MailStore::open(&db_path, MailStoreConfig::default()).unwrap();
        store.publish(NewEvent::new("A", "producer")).unwrap()
    };
    let store = MailStore::open(&db_path, MailStoreConfig::default()).unwrap();
    let second = store.publish(NewEvent::new("B", "producer")).unwrap();
    assert!(second > first);

    let listed = store.list_events(0, 10).unwrap();
    let ids: Vec<i64> = listed.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted);
}

#[test]
fn claim_timeout_is_bounded() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let started = std::time::Instant::now();
    let claimed = store
        .claim("worker:idle:1", None, true, None, Duration::from_millis(150))
        .unwrap();
    assert!(claimed.is_none());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(2), "claim wait must be bounded");
}
