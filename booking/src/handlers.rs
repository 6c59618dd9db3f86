//! Adapters from service reactions to the runtime's [`EventHandler`].
//!
//! One handler per service; each consumer attaches a fresh instance to one
//! of the queues that service understands. The correlation id rides on the
//! envelope and is threaded into every service call unchanged.
//!
//! Decoding into [`SagaEvent`] can fail even for a valid envelope (a
//! foreign payload on the queue); the error propagates into the consumer's
//! retry/dead-letter machinery, where it belongs.

use crate::booking::BookingService;
use crate::events::SagaEvent;
use crate::inventory::InventoryService;
use crate::payment::{PaymentGateway, PaymentService};
use std::sync::Arc;
use steadfast_core::environment::Clock;
use steadfast_runtime::consumer::{EventHandler, handler_fn};

/// Handler for every queue the booking service consumes
/// (`inventory.reservation-failed`, `payment.succeeded`, `payment.failed`).
pub fn booking_handler<C>(service: Arc<BookingService<C>>) -> impl EventHandler
where
    C: Clock + Send + Sync + 'static,
{
    handler_fn(move |envelope| {
        let service = Arc::clone(&service);
        async move {
            let correlation_id = envelope.correlation_id;
            match envelope.decode::<SagaEvent>()? {
                SagaEvent::ItemReservationFailed {
                    booking_id, reason, ..
                } => {
                    service.apply_reservation_failed(booking_id, &reason, correlation_id)?;
                }
                SagaEvent::PaymentSucceeded { booking_id, .. } => {
                    service.apply_payment_succeeded(booking_id, correlation_id)?;
                }
                SagaEvent::PaymentFailed { booking_id, reason } => {
                    service.apply_payment_failed(booking_id, &reason, correlation_id)?;
                }
                other => anyhow::bail!(
                    "booking service does not handle {}",
                    steadfast_core::envelope::DomainEvent::event_name(&other)
                ),
            }
            Ok(())
        }
    })
}

/// Handler for every queue the inventory service consumes
/// (`booking.requested`, `payment.failed`).
pub fn inventory_handler<C>(service: Arc<InventoryService<C>>) -> impl EventHandler
where
    C: Clock + Send + Sync + 'static,
{
    handler_fn(move |envelope| {
        let service = Arc::clone(&service);
        async move {
            let correlation_id = envelope.correlation_id;
            match envelope.decode::<SagaEvent>()? {
                SagaEvent::BookingRequested {
                    booking_id,
                    item_id,
                    amount_cents,
                } => {
                    service.handle_booking_requested(
                        booking_id,
                        &item_id,
                        amount_cents,
                        correlation_id,
                    )?;
                }
                SagaEvent::PaymentFailed { booking_id, .. } => {
                    service.handle_payment_failed(booking_id, correlation_id)?;
                }
                other => anyhow::bail!(
                    "inventory service does not handle {}",
                    steadfast_core::envelope::DomainEvent::event_name(&other)
                ),
            }
            Ok(())
        }
    })
}

/// Handler for the queue the payment service consumes
/// (`inventory.item-reserved`).
pub fn payment_handler<G, C>(service: Arc<PaymentService<G, C>>) -> impl EventHandler
where
    G: PaymentGateway + 'static,
    C: Clock + Send + Sync + 'static,
{
    handler_fn(move |envelope| {
        let service = Arc::clone(&service);
        async move {
            let correlation_id = envelope.correlation_id;
            match envelope.decode::<SagaEvent>()? {
                SagaEvent::ItemReserved {
                    booking_id,
                    amount_cents,
                    ..
                } => {
                    service.handle_item_reserved(booking_id, amount_cents, correlation_id)?;
                }
                other => anyhow::bail!(
                    "payment service does not handle {}",
                    steadfast_core::envelope::DomainEvent::event_name(&other)
                ),
            }
            Ok(())
        }
    })
}
