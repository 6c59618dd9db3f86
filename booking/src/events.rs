//! The saga's event vocabulary.
//!
//! One broker queue exists per event name (direct routing by queue name),
//! so the [`DomainEvent::event_name`] values below double as the queue
//! topology. The [`queues`] constants spell them out for subscribers.
//!
//! Happy path:
//!
//! ```text
//! booking.requested → inventory.item-reserved → payment.succeeded → CONFIRMED
//! ```
//!
//! Compensation paths:
//!
//! ```text
//! inventory.reservation-failed ─────────────────────────► CANCELLED(reason)
//! payment.failed ──► inventory.reservation-released  and  CANCELLED(reason)
//! ```

use serde::{Deserialize, Serialize};
use steadfast_core::envelope::DomainEvent;
use uuid::Uuid;

/// Queue names, one per event type.
pub mod queues {
    /// A booking was created and wants an item reserved.
    pub const BOOKING_REQUESTED: &str = "booking.requested";
    /// The inventory service reserved the item.
    pub const ITEM_RESERVED: &str = "inventory.item-reserved";
    /// The inventory service could not reserve the item.
    pub const RESERVATION_FAILED: &str = "inventory.reservation-failed";
    /// The reservation was released as compensation.
    pub const RESERVATION_RELEASED: &str = "inventory.reservation-released";
    /// The payment service charged the booking.
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    /// The payment service declined the booking.
    pub const PAYMENT_FAILED: &str = "payment.failed";
}

/// Every event exchanged between the three services.
///
/// Events are facts, named in the past tense, and immutable once emitted.
/// The correlation id is not part of the payload — it rides on the
/// envelope, minted once at [`begin_booking`] and copied verbatim
/// downstream.
///
/// [`begin_booking`]: crate::booking::BookingService::begin_booking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaEvent {
    /// A booking entered the saga (emitted by the booking service).
    BookingRequested {
        /// The booking aggregate.
        booking_id: Uuid,
        /// What to reserve.
        item_id: String,
        /// What the payment service should charge.
        amount_cents: u64,
    },

    /// Reservation succeeded (emitted by the inventory service).
    ItemReserved {
        /// The booking aggregate.
        booking_id: Uuid,
        /// The reserved item.
        item_id: String,
        /// Carried through for the payment step.
        amount_cents: u64,
    },

    /// Reservation failed — an expected business outcome, not an error
    /// (emitted by the inventory service).
    ItemReservationFailed {
        /// The booking aggregate.
        booking_id: Uuid,
        /// The item that could not be reserved.
        item_id: String,
        /// Why, e.g. "capacity exceeded".
        reason: String,
    },

    /// Compensating action: a previously reserved item went back to the
    /// pool (emitted by the inventory service on payment failure).
    ReservationReleased {
        /// The booking aggregate.
        booking_id: Uuid,
        /// The released item.
        item_id: String,
    },

    /// The charge went through (emitted by the payment service).
    PaymentSucceeded {
        /// The booking aggregate.
        booking_id: Uuid,
        /// The charged amount.
        amount_cents: u64,
    },

    /// The charge was declined (emitted by the payment service).
    PaymentFailed {
        /// The booking aggregate.
        booking_id: Uuid,
        /// Why, e.g. "card declined".
        reason: String,
    },
}

impl DomainEvent for SagaEvent {
    fn event_name(&self) -> &'static str {
        match self {
            Self::BookingRequested { .. } => queues::BOOKING_REQUESTED,
            Self::ItemReserved { .. } => queues::ITEM_RESERVED,
            Self::ItemReservationFailed { .. } => queues::RESERVATION_FAILED,
            Self::ReservationReleased { .. } => queues::RESERVATION_RELEASED,
            Self::PaymentSucceeded { .. } => queues::PAYMENT_SUCCEEDED,
            Self::PaymentFailed { .. } => queues::PAYMENT_FAILED,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use steadfast_core::envelope::EventEnvelope;

    #[test]
    fn event_names_match_queue_topology() {
        let event = SagaEvent::PaymentFailed {
            booking_id: Uuid::new_v4(),
            reason: "card declined".into(),
        };
        assert_eq!(event.event_name(), queues::PAYMENT_FAILED);
    }

    #[test]
    fn events_survive_the_envelope_roundtrip() {
        let event = SagaEvent::ItemReserved {
            booking_id: Uuid::new_v4(),
            item_id: "room-101".into(),
            amount_cents: 12_500,
        };

        let envelope = EventEnvelope::wrap(&event, Uuid::new_v4(), Utc::now()).unwrap();
        assert_eq!(envelope.event_name, queues::ITEM_RESERVED);

        let decoded: SagaEvent = envelope.decode().unwrap();
        assert_eq!(decoded, event);
    }
}
