/// Integration tests: RetryQueue semantics.
///
/// Every scenario runs against both stores so the in-memory store and the
/// SQLite store stay behaviorally identical.
use std::sync::Arc;
use std::time::Duration;

use transit_queue::{
    MemoryQueueStore, QueueConfig, QueueKey, QueueStore, RetryQueue, SqliteQueueStore,
};

const MIN: u64 = 60_000;

fn queues() -> Vec<(&'static str, RetryQueue)> {
    let memory: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
    let sqlite: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    vec![
        ("memory", RetryQueue::new(QueueConfig::new("outbox"), memory)),
        ("sqlite", RetryQueue::new(QueueConfig::new("outbox"), sqlite)),
    ]
}

fn key(kind: &str) -> QueueKey {
    QueueKey::new("drive/file", kind).unwrap()
}

fn kinds(lease: &transit_queue::Lease) -> Vec<String> {
    lease.items.iter().map(|i| i.key.kind().to_string()).collect()
}

#[test]
fn pop_is_fifo_by_creation_time() {
    for (store, q) in queues() {
        q.upsert_at(&key("second"), b"2", 200).unwrap();
        q.upsert_at(&key("first"), b"1", 100).unwrap();
        q.upsert_at(&key("third"), b"3", 300).unwrap();

        let lease = q.pop_at(2, 1_000).unwrap();
        assert_eq!(kinds(&lease), ["first", "second"], "{store}");

        let rest = q.pop_at(10, 1_000).unwrap();
        assert_eq!(kinds(&rest), ["third"], "{store}");
        assert_ne!(lease.token, rest.token, "{store}");
    }
}

#[test]
fn one_token_per_pop() {
    for (store, q) in queues() {
        for k in ["a", "b", "c"] {
            q.upsert_at(&key(k), b"", 0).unwrap();
        }
        let lease = q.pop_at(10, 0).unwrap();
        assert_eq!(lease.len(), 3, "{store}");
        assert!(lease.items.iter().all(|i| i.is_held_by(&lease.token)), "{store}");
    }
}

#[test]
fn items_not_yet_due_are_skipped() {
    for (store, q) in queues() {
        q.upsert_at(&key("later"), b"", 5_000).unwrap();
        assert!(q.pop_at(10, 4_999).unwrap().is_empty(), "{store}");
        assert_eq!(q.pop_at(10, 5_000).unwrap().len(), 1, "{store}");
    }
}

#[test]
fn leased_items_are_invisible_to_pop() {
    for (store, q) in queues() {
        q.upsert_at(&key("a"), b"", 0).unwrap();
        let _lease = q.pop_at(1, 0).unwrap();
        // Even far in the future, a held lease is never handed out twice.
        assert!(q.pop_at(10, 100 * MIN).unwrap().is_empty(), "{store}");
    }
}

#[test]
fn backoff_doubles_per_attempt() {
    for (store, q) in queues() {
        q.upsert_at(&key("a"), b"", 0).unwrap();
        let mut now = 0;
        let mut expected_delay = MIN;
        for attempt in 1..=4u32 {
            let lease = q.pop_at(1, now).unwrap();
            let item = &lease.items[0];
            assert_eq!(item.run_count, attempt, "{store}");
            assert_eq!(item.last_run_at, Some(now), "{store}");
            assert_eq!(item.next_run_at, now + expected_delay, "{store}");
            q.cancel(&lease.token, &lease.keys()).unwrap();

            // Not due one millisecond early.
            assert!(q.pop_at(1, now + expected_delay - 1).unwrap().is_empty(), "{store}");
            now += expected_delay;
            expected_delay *= 2;
        }
    }
}

#[test]
fn backoff_is_capped() {
    let q = RetryQueue::in_memory(
        QueueConfig::new("capped")
            .backoff_base(Duration::from_secs(60))
            .backoff_max(Duration::from_secs(150)),
    );
    q.upsert_at(&key("a"), b"", 0).unwrap();
    let mut now = 0;
    let mut delays = vec![];
    for _ in 0..4 {
        let lease = q.pop_at(1, now).unwrap();
        let next = lease.items[0].next_run_at;
        delays.push(next - now);
        q.cancel(&lease.token, &lease.keys()).unwrap();
        now = next;
    }
    assert_eq!(delays, [60_000, 120_000, 150_000, 150_000]);
}

#[test]
fn commit_is_idempotent() {
    for (store, q) in queues() {
        q.upsert_at(&key("a"), b"", 0).unwrap();
        let lease = q.pop_at(1, 0).unwrap();
        assert_eq!(q.commit(&lease.token, &lease.keys()).unwrap(), 1, "{store}");
        assert_eq!(q.commit(&lease.token, &lease.keys()).unwrap(), 0, "{store}");
        assert_eq!(q.commit(&lease.token, &[key("never-existed")]).unwrap(), 0, "{store}");
        assert_eq!(q.status().unwrap().total, 0, "{store}");
    }
}

#[test]
fn cancel_keeps_schedule_and_run_count() {
    for (store, q) in queues() {
        q.upsert_at(&key("a"), b"", 0).unwrap();
        let lease = q.pop_at(1, 0).unwrap();
        assert_eq!(q.cancel(&lease.token, &lease.keys()).unwrap(), 1, "{store}");

        let item = q.get(&key("a")).unwrap().unwrap();
        assert!(item.lease.is_none(), "{store}");
        assert_eq!(item.run_count, 1, "{store}");
        assert_eq!(item.next_run_at, MIN, "{store}");
    }
}

#[test]
fn upsert_supersedes_in_flight_lease() {
    for (store, q) in queues() {
        q.upsert_at(&key("a"), b"old", 0).unwrap();
        let stale = q.pop_at(1, 0).unwrap();

        q.upsert_at(&key("a"), b"new", 10).unwrap();
        let item = q.get(&key("a")).unwrap().unwrap();
        assert_eq!(item.payload, b"new", "{store}");
        assert_eq!(item.run_count, 0, "{store}");
        assert_eq!(item.next_run_at, 10, "{store}");
        assert!(item.lease.is_none(), "{store}");

        // The old attempt finishing late must not erase the new payload.
        assert_eq!(q.commit(&stale.token, &stale.keys()).unwrap(), 0, "{store}");
        assert_eq!(q.cancel(&stale.token, &stale.keys()).unwrap(), 0, "{store}");

        let fresh = q.pop_at(1, 10).unwrap();
        assert_eq!(fresh.items[0].payload, b"new", "{store}");
        assert_eq!(q.commit(&fresh.token, &fresh.keys()).unwrap(), 1, "{store}");
    }
}

#[test]
fn upsert_moves_item_to_back_of_fifo() {
    for (store, q) in queues() {
        q.upsert_at(&key("a"), b"", 0).unwrap();
        q.upsert_at(&key("b"), b"", 0).unwrap();
        q.upsert_at(&key("a"), b"again", 0).unwrap();
        let lease = q.pop_at(10, 0).unwrap();
        assert_eq!(kinds(&lease), ["b", "a"], "{store}");
    }
}

#[test]
fn recover_dead_makes_items_due_immediately() {
    for (store, q) in queues() {
        q.upsert_at(&key("old"), b"", 0).unwrap();
        q.upsert_at(&key("young"), b"", 0).unwrap();
        let old = q.pop_at(1, 1_000).unwrap();
        let young = q.pop_at(1, 50_000).unwrap();
        assert_eq!(kinds(&old), ["old"], "{store}");
        assert_eq!(kinds(&young), ["young"], "{store}");

        assert_eq!(q.recover_dead(10_000).unwrap(), 1, "{store}");

        let item = q.get(&key("old")).unwrap().unwrap();
        assert!(item.lease.is_none(), "{store}");
        assert_eq!(item.next_run_at, 1_000, "{store}");

        let again = q.pop_at(10, 50_000).unwrap();
        assert_eq!(kinds(&again), ["old"], "{store}");
        assert_eq!(again.items[0].run_count, 2, "{store}");

        // The dead holder comes back: its token no longer matches.
        assert_eq!(q.commit(&old.token, &old.keys()).unwrap(), 0, "{store}");
        assert_eq!(q.recover_dead(0).unwrap(), 0, "{store}");
    }
}

#[test]
fn status_counts_and_next_run() {
    for (store, q) in queues() {
        q.upsert_at(&key("a"), b"", 100).unwrap();
        q.upsert_at(&key("b"), b"", 200).unwrap();
        q.upsert_at(&key("c"), b"", 300).unwrap();
        let _lease = q.pop_at(1, 100).unwrap();

        let status = q.status().unwrap();
        assert_eq!(status.total, 3, "{store}");
        assert_eq!(status.leased, 1, "{store}");
        assert_eq!(status.next_run_at, Some(200), "{store}");
    }
}

#[test]
fn queues_sharing_a_store_do_not_interfere() {
    let store: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    let outbox = RetryQueue::new(QueueConfig::new("outbox"), store.clone());
    let inbox = RetryQueue::new(QueueConfig::new("inbox"), store);

    outbox.upsert_at(&key("a"), b"out", 0).unwrap();
    inbox.upsert_at(&key("a"), b"in", 0).unwrap();

    let lease = inbox.pop_at(10, 0).unwrap();
    assert_eq!(lease.items[0].payload, b"in");
    assert_eq!(outbox.commit(&lease.token, &lease.keys()).unwrap(), 0);
    assert_eq!(outbox.status().unwrap().total, 1);
}

#[test]
fn dependent_item_waits_for_its_dependency() {
    for (store, q) in queues() {
        q.upsert_after_at(&key("comment"), b"c", Some(&key("photo")), 0).unwrap();
        q.upsert_at(&key("photo"), b"p", 10).unwrap();

        // The comment is older but stays behind the photo.
        let first = q.pop_at(10, 100).unwrap();
        assert_eq!(kinds(&first), ["photo"], "{store}");

        // A leased dependency still blocks.
        assert!(q.pop_at(10, 100 * MIN).unwrap().is_empty(), "{store}");

        q.commit(&first.token, &first.keys()).unwrap();
        let second = q.pop_at(10, 100 * MIN).unwrap();
        assert_eq!(kinds(&second), ["comment"], "{store}");
        assert_eq!(second.items[0].depends_on, Some(key("photo")), "{store}");
    }
}

#[test]
fn cancelled_dependency_keeps_blocking() {
    for (store, q) in queues() {
        q.upsert_at(&key("photo"), b"p", 0).unwrap();
        q.upsert_after_at(&key("comment"), b"c", Some(&key("photo")), 0).unwrap();

        let lease = q.pop_at(10, 0).unwrap();
        assert_eq!(kinds(&lease), ["photo"], "{store}");
        q.cancel(&lease.token, &lease.keys()).unwrap();

        let retry = q.pop_at(10, 100 * MIN).unwrap();
        assert_eq!(kinds(&retry), ["photo"], "{store}");
    }
}

#[test]
fn missing_dependency_does_not_block() {
    for (store, q) in queues() {
        q.upsert_after_at(&key("comment"), b"c", Some(&key("gone")), 0).unwrap();
        assert_eq!(kinds(&q.pop_at(10, 0).unwrap()), ["comment"], "{store}");
    }
}

#[test]
fn self_dependency_is_rejected() {
    for (store, q) in queues() {
        let result = q.upsert_after_at(&key("a"), b"", Some(&key("a")), 0);
        assert!(
            matches!(result, Err(transit_queue::QueueError::InvalidKey { .. })),
            "{store}"
        );
        assert_eq!(q.status().unwrap().total, 0, "{store}");
    }
}

#[test]
fn plain_upsert_clears_an_old_dependency() {
    for (store, q) in queues() {
        q.upsert_at(&key("photo"), b"p", 0).unwrap();
        q.upsert_after_at(&key("comment"), b"c", Some(&key("photo")), 0).unwrap();
        q.upsert_at(&key("comment"), b"c2", 1).unwrap();

        let lease = q.pop_at(10, 10).unwrap();
        assert_eq!(kinds(&lease), ["photo", "comment"], "{store}");
    }
}
