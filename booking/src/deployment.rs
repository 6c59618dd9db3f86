//! Composition root for the three-service saga.
//!
//! Wires one relay per service (each service drains only its own outbox)
//! and one consumer per (service, queue) subscription:
//!
//! | queue                           | consumer  |
//! |---------------------------------|-----------|
//! | `booking.requested`             | inventory |
//! | `inventory.item-reserved`       | payment   |
//! | `inventory.reservation-failed`  | booking   |
//! | `payment.succeeded`             | booking   |
//! | `payment.failed`                | booking **and** inventory |
//!
//! `payment.failed` fans out to two services: the booking side cancels,
//! the inventory side runs the compensating release. All tasks share one
//! shutdown signal and nothing else; the stores arbitrate everything.

use crate::booking::BookingService;
use crate::events::queues;
use crate::handlers::{booking_handler, inventory_handler, payment_handler};
use crate::inventory::InventoryService;
use crate::payment::{PaymentGateway, PaymentService};
use std::sync::Arc;
use steadfast_core::environment::Clock;
use steadfast_core::queue::MessageQueue;
use steadfast_runtime::consumer::{ConsumerConfig, EventHandler, ResilientConsumer};
use steadfast_runtime::publisher::ResilientPublisher;
use steadfast_runtime::relay::{OutboxRelay, RelayConfig};
use steadfast_runtime::retry::RetryPolicy;
use steadfast_testing::{InMemoryDeadLetterStore, InMemoryOutboxStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Tunables for a deployment, externally supplied.
#[derive(Debug, Clone, Default)]
pub struct DeploymentConfig {
    /// Relay settings, shared by all three relays.
    pub relay: RelayConfig,
    /// Consumer settings, shared by all consumers.
    pub consumer: ConsumerConfig,
    /// Publish pipeline policy.
    pub publish: RetryPolicy,
}

/// A running three-service deployment over one broker.
pub struct SagaDeployment<G, C> {
    /// The booking service (saga entry point).
    pub booking: Arc<BookingService<C>>,
    /// The inventory service.
    pub inventory: Arc<InventoryService<C>>,
    /// The payment service.
    pub payment: Arc<PaymentService<G, C>>,
    /// The shared dead-letter sink.
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<G, C> SagaDeployment<G, C>
where
    G: PaymentGateway + 'static,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Spawn relays and consumers for all three services on `queue`.
    pub fn start<Q>(queue: &Arc<Q>, gateway: G, clock: C, config: &DeploymentConfig) -> Self
    where
        Q: MessageQueue + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());

        let booking = Arc::new(BookingService::new(
            InMemoryOutboxStore::new(),
            clock.clone(),
        ));
        let inventory = Arc::new(InventoryService::new(
            InMemoryOutboxStore::new(),
            clock.clone(),
        ));
        let payment = Arc::new(PaymentService::new(
            InMemoryOutboxStore::new(),
            gateway,
            clock.clone(),
        ));

        let mut tasks = Vec::new();

        for (service_name, outbox) in [
            ("booking", booking.outbox()),
            ("inventory", inventory.outbox()),
            ("payment", payment.outbox()),
        ] {
            let relay = OutboxRelay::new(
                service_name,
                Arc::new(outbox),
                ResilientPublisher::with_policy(Arc::clone(queue), config.publish.clone()),
                clock.clone(),
                config.relay.clone(),
            );
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { relay.run(rx).await }));
        }

        let subscriptions: Vec<(&str, Box<dyn EventHandler>)> = vec![
            (queues::BOOKING_REQUESTED, Box::new(inventory_handler(Arc::clone(&inventory)))),
            (queues::ITEM_RESERVED, Box::new(payment_handler(Arc::clone(&payment)))),
            (queues::RESERVATION_FAILED, Box::new(booking_handler(Arc::clone(&booking)))),
            (queues::PAYMENT_SUCCEEDED, Box::new(booking_handler(Arc::clone(&booking)))),
            (queues::PAYMENT_FAILED, Box::new(booking_handler(Arc::clone(&booking)))),
            (queues::PAYMENT_FAILED, Box::new(inventory_handler(Arc::clone(&inventory)))),
        ];

        for (queue_name, handler) in subscriptions {
            let consumer = ResilientConsumer::new(
                queue_name,
                Arc::clone(queue),
                Arc::clone(&dead_letters),
                handler,
                clock.clone(),
                config.consumer.clone(),
            );
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { consumer.run(rx).await }));
        }

        Self {
            booking,
            inventory,
            payment,
            dead_letters,
            shutdown,
            tasks,
        }
    }

    /// Signal shutdown and wait for every relay and consumer to finish its
    /// in-flight work.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
