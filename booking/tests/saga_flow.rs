//! End-to-end saga scenarios over the full delivery stack: outbox stores,
//! relays, the in-memory broker, resilient consumers, and the three
//! services' handlers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;
use steadfast_booking::deployment::{DeploymentConfig, SagaDeployment};
use steadfast_booking::events::queues;
use steadfast_booking::payment::{ApproveAll, ChargeOutcome, DeclineAll};
use steadfast_booking::BookingStatus;
use steadfast_core::environment::SystemClock;
use steadfast_core::queue::MessageQueue;
use steadfast_runtime::consumer::ConsumerConfig;
use steadfast_runtime::relay::RelayConfig;
use steadfast_runtime::retry::RetryPolicy;
use steadfast_testing::{InMemoryQueue, envelope_message};

fn fast_config() -> DeploymentConfig {
    DeploymentConfig {
        relay: RelayConfig {
            poll_interval: Duration::from_millis(20),
            batch_size: 10,
            max_retries: 3,
            shutdown_grace: Duration::from_secs(1),
        },
        consumer: ConsumerConfig {
            max_requeue_attempts: 3,
            requeue_delay: Duration::from_millis(5),
            handler_policy: RetryPolicy::handler()
                .with_max_attempts(2)
                .with_initial_delay(Duration::from_millis(2))
                .with_jitter(false),
        },
        publish: RetryPolicy::publish()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false),
    }
}

async fn eventually<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true: {what}");
}

/// Scenario A: reservation succeeds, payment succeeds, booking confirms —
/// and one correlation id threads through every event of the instance.
#[tokio::test]
async fn happy_path_confirms_the_booking() {
    let queue = Arc::new(InMemoryQueue::new());
    let deployment =
        SagaDeployment::start(&queue, ApproveAll, SystemClock, &fast_config());

    deployment.inventory.add_capacity("room-101", 5);
    let booking = deployment
        .booking
        .begin_booking("room-101", 12_500)
        .unwrap();

    {
        let booking_service = Arc::clone(&deployment.booking);
        let booking_id = booking.id;
        eventually(
            move || booking_service.status(booking_id) == Some(BookingStatus::Confirmed),
            "booking confirmed",
        )
        .await;
    }

    assert_eq!(deployment.inventory.available("room-101"), 4);
    assert!(deployment.inventory.has_reservation(booking.id));
    assert_eq!(
        deployment.payment.outcome(booking.id),
        Some(ChargeOutcome::Charged {
            amount_cents: 12_500
        })
    );

    // Correlation integrity: every event of the instance carries the id
    // minted at the entry point.
    for queue_name in [
        queues::BOOKING_REQUESTED,
        queues::ITEM_RESERVED,
        queues::PAYMENT_SUCCEEDED,
    ] {
        let envelopes = queue.published_envelopes(queue_name);
        assert_eq!(envelopes.len(), 1, "exactly one event on {queue_name}");
        assert_eq!(envelopes[0].correlation_id, booking.correlation_id);
    }

    // No compensation was ever produced.
    assert!(queue.published_history(queues::PAYMENT_FAILED).is_empty());
    assert!(queue.published_history(queues::RESERVATION_FAILED).is_empty());
    assert!(queue.published_history(queues::RESERVATION_RELEASED).is_empty());
    assert!(deployment.dead_letters.all_records().is_empty());

    deployment.shutdown().await;
}

/// Scenario B: reservation fails, booking cancels with the reason, and no
/// payment event is ever produced.
#[tokio::test]
async fn capacity_exceeded_cancels_without_touching_payment() {
    let queue = Arc::new(InMemoryQueue::new());
    let deployment =
        SagaDeployment::start(&queue, ApproveAll, SystemClock, &fast_config());

    // No capacity seeded at all.
    let booking = deployment.booking.begin_booking("room-101", 9_900).unwrap();

    {
        let booking_service = Arc::clone(&deployment.booking);
        let booking_id = booking.id;
        eventually(
            move || {
                matches!(
                    booking_service.status(booking_id),
                    Some(BookingStatus::Cancelled { .. })
                )
            },
            "booking cancelled",
        )
        .await;
    }

    assert_eq!(
        deployment.booking.status(booking.id),
        Some(BookingStatus::Cancelled {
            reason: "capacity exceeded".into()
        })
    );

    // The payment service was never involved.
    assert!(queue.published_history(queues::ITEM_RESERVED).is_empty());
    assert!(queue.published_history(queues::PAYMENT_SUCCEEDED).is_empty());
    assert!(queue.published_history(queues::PAYMENT_FAILED).is_empty());
    assert!(deployment.payment.outcome(booking.id).is_none());

    deployment.shutdown().await;
}

/// Scenario C: payment fails after a successful reservation — the
/// reservation is released (compensation) and the booking cancels.
#[tokio::test]
async fn payment_failure_releases_the_reservation_and_cancels() {
    let queue = Arc::new(InMemoryQueue::new());
    let deployment = SagaDeployment::start(
        &queue,
        DeclineAll {
            reason: "card declined".into(),
        },
        SystemClock,
        &fast_config(),
    );

    deployment.inventory.add_capacity("room-101", 1);
    let booking = deployment.booking.begin_booking("room-101", 9_900).unwrap();

    {
        let booking_service = Arc::clone(&deployment.booking);
        let booking_id = booking.id;
        eventually(
            move || {
                matches!(
                    booking_service.status(booking_id),
                    Some(BookingStatus::Cancelled { .. })
                )
            },
            "booking cancelled",
        )
        .await;
    }
    {
        let queue = Arc::clone(&queue);
        eventually(
            move || !queue.published_history(queues::RESERVATION_RELEASED).is_empty(),
            "reservation released",
        )
        .await;
    }

    assert_eq!(
        deployment.booking.status(booking.id),
        Some(BookingStatus::Cancelled {
            reason: "card declined".into()
        })
    );

    // Exactly one compensation, carrying the same correlation id.
    let releases = queue.published_envelopes(queues::RESERVATION_RELEASED);
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].correlation_id, booking.correlation_id);

    // The item went back into the pool.
    {
        let inventory = Arc::clone(&deployment.inventory);
        eventually(
            move || inventory.available("room-101") == 1,
            "capacity restored",
        )
        .await;
    }
    assert!(!deployment.inventory.has_reservation(booking.id));

    deployment.shutdown().await;
}

/// Scenario D: a duplicate `payment.failed` for an already-cancelled
/// booking is a no-op — no state change, no second compensation.
#[tokio::test]
async fn duplicate_payment_failure_after_cancellation_is_a_no_op() {
    let queue = Arc::new(InMemoryQueue::new());
    let deployment = SagaDeployment::start(
        &queue,
        DeclineAll {
            reason: "card declined".into(),
        },
        SystemClock,
        &fast_config(),
    );

    deployment.inventory.add_capacity("room-101", 1);
    let booking = deployment.booking.begin_booking("room-101", 9_900).unwrap();

    {
        let queue = Arc::clone(&queue);
        let booking_service = Arc::clone(&deployment.booking);
        let booking_id = booking.id;
        eventually(
            move || {
                matches!(
                    booking_service.status(booking_id),
                    Some(BookingStatus::Cancelled { .. })
                ) && !queue.published_history(queues::RESERVATION_RELEASED).is_empty()
            },
            "saga compensated",
        )
        .await;
    }
    let status_before = deployment.booking.status(booking.id);

    // Re-deliver the original payment.failed envelope, verbatim.
    let failure = queue.published_envelopes(queues::PAYMENT_FAILED)[0].clone();
    queue
        .publish(
            queues::PAYMENT_FAILED,
            envelope_message(&failure, chrono::Utc::now()),
        )
        .await
        .unwrap();

    // Both subscribers (booking and inventory) get the duplicate; give
    // them time to process it.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(deployment.booking.status(booking.id), status_before);
    assert_eq!(
        queue.published_envelopes(queues::RESERVATION_RELEASED).len(),
        1,
        "no duplicate compensation"
    );
    assert_eq!(deployment.inventory.available("room-101"), 1);
    assert!(deployment.dead_letters.all_records().is_empty());

    deployment.shutdown().await;
}

/// Idempotent handling: the same `item-reserved` envelope delivered twice
/// produces one charge and one `payment.succeeded`.
#[tokio::test]
async fn duplicate_delivery_never_double_charges() {
    let queue = Arc::new(InMemoryQueue::new());
    let deployment =
        SagaDeployment::start(&queue, ApproveAll, SystemClock, &fast_config());

    deployment.inventory.add_capacity("room-101", 5);
    let booking = deployment
        .booking
        .begin_booking("room-101", 12_500)
        .unwrap();

    {
        let booking_service = Arc::clone(&deployment.booking);
        let booking_id = booking.id;
        eventually(
            move || booking_service.status(booking_id) == Some(BookingStatus::Confirmed),
            "booking confirmed",
        )
        .await;
    }

    // Re-deliver the reservation event, byte-for-byte.
    let reserved = queue.published_envelopes(queues::ITEM_RESERVED)[0].clone();
    queue
        .publish(
            queues::ITEM_RESERVED,
            envelope_message(&reserved, chrono::Utc::now()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        queue.published_envelopes(queues::PAYMENT_SUCCEEDED).len(),
        1,
        "no duplicate charge event"
    );
    assert_eq!(
        deployment.payment.outcome(booking.id),
        Some(ChargeOutcome::Charged {
            amount_cents: 12_500
        })
    );

    deployment.shutdown().await;
}

/// Atomicity at the entry point: a rejected request records neither the
/// aggregate nor the event.
#[tokio::test]
async fn rejected_booking_request_emits_nothing() {
    let queue = Arc::new(InMemoryQueue::new());
    let deployment =
        SagaDeployment::start(&queue, ApproveAll, SystemClock, &fast_config());

    assert!(deployment.booking.begin_booking("room-101", 0).is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.published_history(queues::BOOKING_REQUESTED).is_empty());

    deployment.shutdown().await;
}
