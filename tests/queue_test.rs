//! Integration tests for the transactional queue core on in-memory SQLite.

use std::collections::HashSet;
use std::time::Duration;

use chrono::TimeDelta;
use txqueue::engine::Engine;
use txqueue::error::Error;
use txqueue::model::*;
use txqueue::store::SqliteStore;

async fn test_engine() -> Engine<SqliteStore> {
    let store = SqliteStore::in_memory()
        .await
        .expect("failed to create in-memory store");
    Engine::new(store)
}

fn minutes(n: i64) -> TimeDelta {
    TimeDelta::minutes(n)
}

/// Enqueue `payload` under its own transaction and commit it.
async fn publish(engine: &Engine<SqliteStore>, queue: QueueId, new: NewMessage) -> MessageId {
    let txn = engine.transactions.start(minutes(1)).await.unwrap();
    let id = engine.queues.enqueue(txn, queue, new).await.unwrap();
    engine.transactions.commit(txn).await.unwrap();
    id
}

async fn active(engine: &Engine<SqliteStore>, queue: QueueId) -> u64 {
    engine
        .queues
        .count(queue, Some(MessageState::Active))
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_queue_names_are_rejected() {
    let engine = test_engine().await;

    let id = engine.queues.create_queue("Orders").await.unwrap();
    assert_eq!(id, QueueId(1));

    let err = engine.queues.create_queue("Orders").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "got {err:?}");

    let err = engine.queues.create_queue(" Orders ").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "got {err:?}");

    let err = engine.queues.create_queue("orders").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "got {err:?}");
}

#[tokio::test]
async fn malformed_queue_names_are_invalid() {
    let engine = test_engine().await;

    for bad in ["", "   ", "has space", "slash/name", "emoji✓"] {
        let err = engine.queues.create_queue(bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{bad:?} gave {err:?}");
    }
    assert!(engine.queues.list_queues().await.unwrap().is_empty());
}

#[tokio::test]
async fn queue_info_by_id_and_name() {
    let engine = test_engine().await;
    let id = engine.queues.create_queue(" billing.v2 ").await.unwrap();

    let by_id = engine.queues.queue_info(id).await.unwrap();
    assert_eq!(by_id.name, "billing.v2");

    let by_name = engine.queues.queue_info("BILLING.V2").await.unwrap();
    assert_eq!(by_name.id, id);

    let err = engine.queues.queue_info(QueueId(99)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn delete_queue_removes_messages_and_lock() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("scratch").await.unwrap();
    let other = engine.queues.create_queue("keep").await.unwrap();

    let m1 = publish(&engine, queue, NewMessage::new("a")).await;
    publish(&engine, queue, NewMessage::new("b")).await;
    publish(&engine, other, NewMessage::new("c")).await;

    let txn = engine.transactions.start(minutes(1)).await.unwrap();
    engine.queues.dequeue(txn, queue).await.unwrap().unwrap();
    assert_eq!(engine.queues.tracked_locks(), 1);

    let removed = engine.queues.delete_queue("scratch").await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(engine.queues.tracked_locks(), 0);

    let err = engine.queues.peek_by_id(m1).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(active(&engine, other).await, 1);

    // The transaction that had pulled from the deleted queue still commits.
    let summary = engine.transactions.commit(txn).await.unwrap();
    assert_eq!(summary.pulled, 0);

    let err = engine.queues.delete_queue(queue).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Visibility and rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueued_messages_are_invisible_until_commit() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();

    let t1 = engine.transactions.start(minutes(5)).await.unwrap();
    let m1 = engine
        .queues
        .enqueue(t1, queue, NewMessage::new("hello"))
        .await
        .unwrap();

    assert_eq!(active(&engine, queue).await, 0);
    assert!(engine.queues.peek(queue).await.unwrap().is_none());

    let pending = engine.queues.peek_by_id(m1).await.unwrap();
    assert_eq!(pending.state, MessageState::InTransaction);
    assert_eq!(pending.transaction_id, Some(t1));
    assert_eq!(pending.transaction_action, Some(TransactionAction::Add));

    let consumer = engine.transactions.start(minutes(5)).await.unwrap();
    assert!(engine.queues.dequeue(consumer, queue).await.unwrap().is_none());

    let summary = engine.transactions.commit(t1).await.unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.pulled, 0);

    assert_eq!(active(&engine, queue).await, 1);
    let visible = engine.queues.peek_by_id(m1).await.unwrap();
    assert_eq!(visible.state, MessageState::Active);
    assert_eq!(visible.transaction_id, None);
    assert_eq!(visible.transaction_action, None);
    assert_eq!(visible.attempts, 0);
}

#[tokio::test]
async fn rollback_erases_adds() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();

    let t2 = engine.transactions.start(minutes(5)).await.unwrap();
    let m2 = engine
        .queues
        .enqueue(t2, queue, NewMessage::new("never"))
        .await
        .unwrap();

    let undone = engine.transactions.rollback(t2, "changed my mind").await.unwrap();
    assert_eq!(undone.discarded, 1);

    let err = engine.queues.peek_by_id(m2).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(engine.queues.count(queue, None).await.unwrap(), 0);

    let txn = engine.transactions.get(t2).await.unwrap();
    assert_eq!(txn.state, TransactionState::RolledBack);
    assert!(txn.end_time.is_some());
    assert_eq!(txn.end_reason.as_deref(), Some("changed my mind"));
}

#[tokio::test]
async fn rollback_returns_pulls_and_exhausts_after_max_attempts() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("retry").await.unwrap();
    let m = publish(&engine, queue, NewMessage::new("flaky").max_attempts(3)).await;

    for attempt in 1..=3u32 {
        let txn = engine.transactions.start(minutes(5)).await.unwrap();
        let claimed = engine.queues.dequeue(txn, queue).await.unwrap().unwrap();
        assert_eq!(claimed.id, m);
        assert_eq!(claimed.state, MessageState::InTransaction);
        assert_eq!(claimed.transaction_action, Some(TransactionAction::Pull));

        let undone = engine.transactions.rollback(txn, "failed").await.unwrap();
        let after = engine.queues.peek_by_id(m).await.unwrap();
        assert_eq!(after.attempts, attempt);
        if attempt < 3 {
            assert_eq!(undone.requeued, 1);
            assert_eq!(after.state, MessageState::Active);
            assert!(after.close_time.is_none());
        } else {
            assert_eq!(undone.exhausted, 1);
            assert_eq!(after.state, MessageState::AttemptsExceeded);
            assert!(after.close_time.is_some());
        }
        assert_eq!(after.transaction_id, None);
    }

    let txn = engine.transactions.start(minutes(5)).await.unwrap();
    assert!(engine.queues.dequeue(txn, queue).await.unwrap().is_none());
}

#[tokio::test]
async fn commit_processes_pulls() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();
    let m = publish(&engine, queue, NewMessage::new("job")).await;

    let txn = engine.transactions.start(minutes(5)).await.unwrap();
    engine.queues.dequeue(txn, queue).await.unwrap().unwrap();
    let summary = engine.transactions.commit(txn).await.unwrap();
    assert_eq!(summary.pulled, 1);

    let done = engine.queues.peek_by_id(m).await.unwrap();
    assert_eq!(done.state, MessageState::Processed);
    assert!(done.close_time.is_some());
    assert_eq!(done.transaction_id, None);

    let closed = engine.transactions.get(txn).await.unwrap();
    assert_eq!(closed.state, TransactionState::Committed);
    assert_eq!(closed.end_reason.as_deref(), Some("Committed"));
}

// ---------------------------------------------------------------------------
// Transaction state machine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_transactions_are_closed() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();

    let txn = engine.transactions.start(minutes(5)).await.unwrap();
    engine.transactions.commit(txn).await.unwrap();

    let err = engine.transactions.commit(txn).await.unwrap_err();
    assert!(matches!(err, Error::Closed(id) if id == txn));
    let err = engine.transactions.rollback(txn, "late").await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
    let err = engine.transactions.extend(txn, minutes(5)).await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
    let err = engine
        .queues
        .enqueue(txn, queue, NewMessage::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
    let err = engine.queues.dequeue(txn, queue).await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
}

#[tokio::test]
async fn unknown_transactions_are_not_found() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();
    let ghost = TransactionId(404);

    for err in [
        engine.transactions.commit(ghost).await.unwrap_err(),
        engine.transactions.rollback(ghost, "x").await.unwrap_err(),
        engine.transactions.extend(ghost, minutes(1)).await.unwrap_err(),
        engine.transactions.get(ghost).await.unwrap_err(),
        engine
            .queues
            .enqueue(ghost, queue, NewMessage::new("x"))
            .await
            .unwrap_err(),
    ] {
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
    }
}

#[tokio::test]
async fn enqueue_into_missing_queue_is_not_found() {
    let engine = test_engine().await;
    let txn = engine.transactions.start(minutes(5)).await.unwrap();

    let err = engine
        .queues
        .enqueue(txn, QueueId(9), NewMessage::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = engine.queues.dequeue(txn, QueueId(9)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // The transaction is still usable.
    engine.transactions.commit(txn).await.unwrap();
}

#[tokio::test]
async fn invalid_messages_are_rejected_before_storage() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();
    let txn = engine.transactions.start(minutes(5)).await.unwrap();

    let err = engine
        .queues
        .enqueue(txn, queue, NewMessage::new("x").max_attempts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = engine
        .queues
        .enqueue(txn, queue, NewMessage::new("x").expires_in(TimeDelta::seconds(-1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = engine.transactions.start(TimeDelta::seconds(-5)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn commit_after_expiry_reports_expired_and_requeues_pulls() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();
    let m = publish(&engine, queue, NewMessage::new("job")).await;

    let t3 = engine
        .transactions
        .start(TimeDelta::milliseconds(500))
        .await
        .unwrap();
    engine.queues.dequeue(t3, queue).await.unwrap().unwrap();
    let added = engine
        .queues
        .enqueue(t3, queue, NewMessage::new("side effect"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;

    let err = engine.transactions.commit(t3).await.unwrap_err();
    assert!(matches!(err, Error::Expired(id) if id == t3), "got {err:?}");

    let returned = engine.queues.peek_by_id(m).await.unwrap();
    assert_eq!(returned.state, MessageState::Active);
    assert_eq!(returned.attempts, 1);
    assert!(engine.queues.peek_by_id(added).await.is_err());

    let txn = engine.transactions.get(t3).await.unwrap();
    assert_eq!(txn.state, TransactionState::Expired);
    assert_eq!(txn.end_reason.as_deref(), Some("Expired"));

    // Later calls keep reporting the expiry.
    let err = engine.transactions.commit(t3).await.unwrap_err();
    assert!(matches!(err, Error::Expired(id) if id == t3), "got {err:?}");
    let err = engine.transactions.extend(t3, TimeDelta::minutes(5)).await.unwrap_err();
    assert!(matches!(err, Error::Expired(_)), "got {err:?}");
}

#[tokio::test]
async fn zero_ttl_transaction_is_expired_on_first_use() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();

    let t = engine.transactions.start(TimeDelta::zero()).await.unwrap();
    let err = engine.transactions.commit(t).await.unwrap_err();
    assert!(matches!(err, Error::Expired(_)));

    let t = engine.transactions.start(TimeDelta::zero()).await.unwrap();
    let err = engine.queues.dequeue(t, queue).await.unwrap_err();
    assert!(matches!(err, Error::Expired(_)));

    let t = engine.transactions.start(TimeDelta::zero()).await.unwrap();
    let err = engine.transactions.rollback(t, "too late").await.unwrap_err();
    assert!(matches!(err, Error::Expired(_)));
    let txn = engine.transactions.get(t).await.unwrap();
    assert_eq!(txn.state, TransactionState::Expired);

    let t = engine.transactions.start(TimeDelta::zero()).await.unwrap();
    let err = engine.transactions.extend(t, minutes(10)).await.unwrap_err();
    assert!(matches!(err, Error::Expired(_)));
}

#[tokio::test]
async fn extend_pushes_expiry_out() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("work").await.unwrap();
    publish(&engine, queue, NewMessage::new("job")).await;

    let txn = engine
        .transactions
        .start(TimeDelta::milliseconds(300))
        .await
        .unwrap();
    let before = engine.transactions.get(txn).await.unwrap().expiry_time;
    let after = engine.transactions.extend(txn, minutes(10)).await.unwrap();
    assert!(after > before);

    engine.queues.dequeue(txn, queue).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let summary = engine.transactions.commit(txn).await.unwrap();
    assert_eq!(summary.pulled, 1);
}

// ---------------------------------------------------------------------------
// Dequeue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dequeue_orders_by_priority_then_age() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("ranked").await.unwrap();

    let low = publish(&engine, queue, NewMessage::new("low").priority(1)).await;
    let high_old = publish(&engine, queue, NewMessage::new("high old").priority(5)).await;
    let high_new = publish(&engine, queue, NewMessage::new("high new").priority(5)).await;
    let neg = publish(&engine, queue, NewMessage::new("neg").priority(-3)).await;

    let peeked = engine.queues.peek(queue).await.unwrap().unwrap();
    assert_eq!(peeked.id, high_old);
    assert_eq!(peeked.state, MessageState::Active);

    let txn = engine.transactions.start(minutes(5)).await.unwrap();
    let mut order = Vec::new();
    while let Some(m) = engine.queues.dequeue(txn, queue).await.unwrap() {
        order.push(m.id);
    }
    assert_eq!(order, vec![high_old, high_new, low, neg]);
}

#[tokio::test]
async fn concurrent_dequeues_never_double_deliver() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("hot").await.unwrap();
    for i in 0..3 {
        publish(&engine, queue, NewMessage::new(format!("job {i}"))).await;
    }

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let txn = engine.transactions.start(minutes(5)).await.unwrap();
            engine.queues.dequeue(txn, queue).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Some(m) => claimed.push(m.id),
            None => empty += 1,
        }
    }

    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 3);
    assert_eq!(distinct.len(), 3);
    assert_eq!(empty, 17);
}

#[tokio::test]
async fn expired_messages_are_not_dequeued() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("ttl").await.unwrap();

    publish(
        &engine,
        queue,
        NewMessage::new("stale").expires_in(TimeDelta::milliseconds(200)),
    )
    .await;
    let fresh = publish(&engine, queue, NewMessage::new("fresh").priority(-1)).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    let txn = engine.transactions.start(minutes(5)).await.unwrap();
    let got = engine.queues.dequeue(txn, queue).await.unwrap().unwrap();
    assert_eq!(got.id, fresh);
    assert!(engine.queues.dequeue(txn, queue).await.unwrap().is_none());
}

#[tokio::test]
async fn message_fields_round_trip() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("fields").await.unwrap();

    let id = publish(
        &engine,
        queue,
        NewMessage::new(vec![0u8, 159, 146, 150])
            .metadata(r#"{"kind":"binary"}"#)
            .priority(7)
            .max_attempts(5)
            .expires_in(minutes(30))
            .correlation_id(42)
            .group_name("batch-1"),
    )
    .await;

    let m = engine.queues.peek_by_id(id).await.unwrap();
    assert_eq!(m.queue_id, queue);
    assert_eq!(m.payload, vec![0u8, 159, 146, 150]);
    assert_eq!(m.metadata, r#"{"kind":"binary"}"#);
    assert_eq!(m.priority, 7);
    assert_eq!(m.max_attempts, 5);
    assert_eq!(m.correlation_id, 42);
    assert_eq!(m.group_name.as_deref(), Some("batch-1"));
    let expiry = m.expiry_time.unwrap();
    assert!(expiry > m.add_time + minutes(29));
}

// ---------------------------------------------------------------------------
// Counting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn active_count_tracks_committed_adds_minus_committed_pulls() {
    let engine = test_engine().await;
    let queue = engine.queues.create_queue("ledger").await.unwrap();

    let mut expected: u64 = 0;
    let script: &[(usize, usize)] = &[(3, 0), (0, 1), (2, 2), (0, 0), (4, 1), (0, 5)];
    for &(adds, pulls) in script {
        let producer = engine.transactions.start(minutes(5)).await.unwrap();
        for i in 0..adds {
            engine
                .queues
                .enqueue(producer, queue, NewMessage::new(format!("m{i}")))
                .await
                .unwrap();
            assert_eq!(active(&engine, queue).await, expected);
        }
        engine.transactions.commit(producer).await.unwrap();
        expected += adds as u64;
        assert_eq!(active(&engine, queue).await, expected);

        let consumer = engine.transactions.start(minutes(5)).await.unwrap();
        let mut pulled = 0;
        for _ in 0..pulls {
            if engine.queues.dequeue(consumer, queue).await.unwrap().is_some() {
                pulled += 1;
            }
        }
        engine.transactions.commit(consumer).await.unwrap();
        expected -= pulled;
        assert_eq!(active(&engine, queue).await, expected);
    }

    let stats = engine.queues.stats(queue).await.unwrap();
    assert_eq!(stats.active, expected);
    assert_eq!(stats.processed, 9 - expected);
    assert_eq!(stats.in_transaction, 0);
    assert_eq!(stats.total(), 9);
}
