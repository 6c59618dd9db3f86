//! Outbox relay behavior against the in-memory broker and store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::envelope::{DomainEvent, EventEnvelope};
use steadfast_core::outbox::OutboxStore;
use steadfast_runtime::relay::{OutboxRelay, RelayConfig};
use steadfast_runtime::retry::RetryPolicy;
use steadfast_runtime::publisher::ResilientPublisher;
use steadfast_testing::{FlakyQueue, InMemoryOutboxStore, InMemoryQueue, test_clock};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeatReserved {
    booking_id: Uuid,
}

impl DomainEvent for SeatReserved {
    fn event_name(&self) -> &'static str {
        "inventory.item-reserved"
    }
}

fn pending_envelope(store: &InMemoryOutboxStore, correlation_id: Uuid) -> EventEnvelope {
    let envelope = EventEnvelope::wrap(
        &SeatReserved {
            booking_id: Uuid::new_v4(),
        },
        correlation_id,
        Utc::now(),
    )
    .unwrap();
    store.append(&envelope).unwrap();
    envelope
}

fn fast_publish_policy() -> RetryPolicy {
    RetryPolicy::publish()
        .with_max_attempts(2)
        .with_initial_delay(Duration::from_millis(5))
        .with_jitter(false)
}

fn fast_config(max_retries: i32) -> RelayConfig {
    RelayConfig {
        poll_interval: Duration::from_millis(20),
        batch_size: 10,
        max_retries,
        shutdown_grace: Duration::from_secs(1),
    }
}

async fn eventually<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true: {what}");
}

#[tokio::test]
async fn relay_publishes_pending_records_in_order() {
    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(InMemoryOutboxStore::new());
    let correlation_id = Uuid::new_v4();

    let first = pending_envelope(&store, correlation_id);
    let second = pending_envelope(&store, correlation_id);

    let relay = OutboxRelay::new(
        "inventory",
        Arc::clone(&store),
        ResilientPublisher::with_policy(Arc::clone(&queue), fast_publish_policy()),
        test_clock(),
        fast_config(3),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

    {
        let queue = Arc::clone(&queue);
        eventually(
            move || queue.published_envelopes("inventory.item-reserved").len() == 2,
            "both records published",
        )
        .await;
    }

    let published = queue.published_envelopes("inventory.item-reserved");
    assert_eq!(published[0].event_id, first.event_id);
    assert_eq!(published[1].event_id, second.event_id);
    // Correlation id travels untouched through store and broker.
    assert!(published.iter().all(|e| e.correlation_id == correlation_id));

    // Both records confirmed in the store.
    assert!(store.all_records().iter().all(|r| r.published));
    assert_eq!(store.count_pending(3).await.unwrap(), 0);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn relay_survives_a_broker_outage() {
    let real = Arc::new(InMemoryQueue::new());
    // Three failed publish attempts before the broker "recovers".
    let queue = Arc::new(FlakyQueue::new(Arc::clone(&real), 3));
    let store = Arc::new(InMemoryOutboxStore::new());

    pending_envelope(&store, Uuid::new_v4());

    let relay = OutboxRelay::new(
        "inventory",
        Arc::clone(&store),
        ResilientPublisher::with_policy(Arc::clone(&queue), fast_publish_policy()),
        test_clock(),
        fast_config(5),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

    {
        let store = Arc::clone(&store);
        eventually(
            move || store.all_records().iter().all(|r| r.published),
            "record published after outage",
        )
        .await;
    }

    // The record went through failure marks before succeeding, and was
    // never abandoned.
    let record = &store.all_records()[0];
    assert!(record.published);
    assert!(record.retry_count >= 1);
    assert!(record.last_error.is_some());
    assert_eq!(real.queue_depth("inventory.item-reserved"), 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn a_stuck_record_does_not_block_fresh_ones() {
    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(InMemoryOutboxStore::new());

    // First record already burned its publish budget (e.g. the broker
    // rejected it on every earlier poll); the second is fresh.
    pending_envelope(&store, Uuid::new_v4());
    let stuck_id = store.all_records()[0].id;
    let good = pending_envelope(&store, Uuid::new_v4());

    for _ in 0..3 {
        store.mark_failed(stuck_id, "unroutable").await.unwrap();
    }

    let relay = OutboxRelay::new(
        "inventory",
        Arc::clone(&store),
        ResilientPublisher::with_policy(Arc::clone(&queue), fast_publish_policy()),
        test_clock(),
        fast_config(3),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

    {
        let queue = Arc::clone(&queue);
        eventually(
            move || queue.published_envelopes("inventory.item-reserved").len() == 1,
            "good record published",
        )
        .await;
    }

    let published = queue.published_envelopes("inventory.item-reserved");
    assert_eq!(published[0].event_id, good.event_id);

    // The exhausted record is skipped, surfaced, and never deleted.
    assert_eq!(store.count_exhausted(3).await.unwrap(), 1);
    let stuck = store.record(stuck_id).unwrap();
    assert!(!stuck.published);
    assert_eq!(stuck.retry_count, 3);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn exhausted_records_are_left_in_place() {
    // A broker that never recovers.
    let real = Arc::new(InMemoryQueue::new());
    let queue = Arc::new(FlakyQueue::new(Arc::clone(&real), usize::MAX));
    let store = Arc::new(InMemoryOutboxStore::new());

    pending_envelope(&store, Uuid::new_v4());

    let relay = OutboxRelay::new(
        "inventory",
        Arc::clone(&store),
        ResilientPublisher::with_policy(Arc::clone(&queue), fast_publish_policy()),
        test_clock(),
        fast_config(2),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

    {
        let store = Arc::clone(&store);
        eventually(
            move || store.all_records()[0].retry_count >= 2,
            "record exhausted",
        )
        .await;
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // Not published, not deleted: operator-visible and queryable.
    let record = &store.all_records()[0];
    assert!(!record.published);
    assert_eq!(record.retry_count, 2);
    assert!(record.last_error.is_some());
    assert!(record.last_attempt_at.is_some());
    assert_eq!(store.count_exhausted(2).await.unwrap(), 1);
}

#[tokio::test]
async fn shutdown_triggers_a_final_best_effort_drain() {
    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(InMemoryOutboxStore::new());

    // Long poll interval: the main loop will be parked in its sleep when
    // the record arrives, so only the final drain can publish it.
    let config = RelayConfig {
        poll_interval: Duration::from_secs(60),
        ..fast_config(3)
    };

    let relay = OutboxRelay::new(
        "inventory",
        Arc::clone(&store),
        ResilientPublisher::with_policy(Arc::clone(&queue), fast_publish_policy()),
        test_clock(),
        config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

    // Let the relay finish its first (empty) pass and park.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let envelope = pending_envelope(&store, Uuid::new_v4());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let published = queue.published_envelopes("inventory.item-reserved");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].event_id, envelope.event_id);
}
