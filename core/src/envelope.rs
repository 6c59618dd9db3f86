//! Event envelope: the wire format shared by every event in the system.
//!
//! An [`EventEnvelope`] is an immutable, append-only fact. It crosses process
//! boundaries as a JSON object and is the only thing a broker ever carries.
//! Consumers never mutate a received envelope; they only mutate the local
//! aggregate state it describes.
//!
//! # Correlation
//!
//! The `correlation_id` is minted once at the entry point of a saga instance
//! and copied verbatim onto every downstream envelope and log line. That is
//! what makes a full end-to-end trace reconstructable without a tracing
//! sidecar.
//!
//! # Example
//!
//! ```
//! use steadfast_core::envelope::{DomainEvent, EventEnvelope};
//! use serde::{Serialize, Deserialize};
//! use uuid::Uuid;
//! use chrono::Utc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct SeatReserved { booking_id: Uuid, seat: String }
//!
//! impl DomainEvent for SeatReserved {
//!     fn event_name(&self) -> &'static str { "inventory.seat-reserved" }
//! }
//!
//! # fn main() -> Result<(), steadfast_core::envelope::EnvelopeError> {
//! let correlation_id = Uuid::new_v4();
//! let event = SeatReserved { booking_id: Uuid::new_v4(), seat: "12A".into() };
//! let envelope = EventEnvelope::wrap(&event, correlation_id, Utc::now())?;
//!
//! let bytes = envelope.to_bytes()?;
//! let roundtrip = EventEnvelope::from_bytes(&bytes)?;
//! let decoded: SeatReserved = roundtrip.decode()?;
//! assert_eq!(decoded.seat, "12A");
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors from envelope encoding and decoding.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Failed to serialize an event payload or envelope to JSON.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize bytes into an envelope, or an envelope's
    /// payload into the requested event type.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// A typed domain event that can be wrapped into an [`EventEnvelope`].
///
/// # Event Naming Convention
///
/// `event_name()` returns the stable discriminator used for routing and
/// dispatch. Use a `service.fact` style name, past tense:
///
/// - `"booking.requested"`
/// - `"inventory.item-reserved"`
/// - `"payment.failed"`
///
/// One broker queue exists per event name, so the name doubles as the
/// destination. Renaming an event is a wire-format change.
pub trait DomainEvent: Serialize + Send + Sync {
    /// Stable discriminator for routing and dispatch.
    fn event_name(&self) -> &'static str;
}

/// The serialized record crossing process boundaries.
///
/// Field-for-field this is the JSON object the broker carries. The envelope
/// is created exactly once, by the producer, and is never modified after
/// that: redelivery, requeueing and dead-lettering all carry the original
/// envelope bytes untouched (diagnostic state travels in message properties,
/// not in the envelope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier, generated at creation. Used for dedup and audit.
    pub event_id: Uuid,

    /// Saga-instance identifier, fixed at the saga's entry point and copied
    /// unchanged onto every event in that instance.
    pub correlation_id: Uuid,

    /// Routing/dispatch discriminator (see [`DomainEvent::event_name`]).
    pub event_name: String,

    /// Creation time, producer clock.
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload.
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap a typed event into an envelope, minting a fresh `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] if the payload cannot
    /// be represented as JSON.
    pub fn wrap<E: DomainEvent>(
        event: &E,
        correlation_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        let data = serde_json::to_value(event)
            .map_err(|e| EnvelopeError::SerializationError(e.to_string()))?;

        Ok(Self {
            event_id: Uuid::new_v4(),
            correlation_id,
            event_name: event.event_name().to_string(),
            timestamp,
            data,
        })
    }

    /// Decode the payload into a concrete event type.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the payload does
    /// not match the requested type.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, EnvelopeError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| EnvelopeError::DeserializationError(e.to_string()))
    }

    /// Serialize the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] on JSON encoding
    /// failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::SerializationError(e.to_string()))
    }

    /// Deserialize an envelope from its JSON wire form.
    ///
    /// A failure here is a *permanent* message defect: the consumer rejects
    /// such a message immediately, without retry or requeue.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the bytes are not
    /// a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes)
            .map_err(|e| EnvelopeError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (event_id={}, correlation_id={})",
            self.event_name, self.event_id, self.correlation_id
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestEvent {
        booking_id: Uuid,
        amount_cents: u64,
    }

    impl DomainEvent for TestEvent {
        fn event_name(&self) -> &'static str {
            "test.happened"
        }
    }

    #[test]
    fn wrap_sets_name_and_correlation() {
        let correlation_id = Uuid::new_v4();
        let event = TestEvent {
            booking_id: Uuid::new_v4(),
            amount_cents: 4200,
        };

        let envelope = EventEnvelope::wrap(&event, correlation_id, Utc::now())
            .expect("wrap should succeed");

        assert_eq!(envelope.event_name, "test.happened");
        assert_eq!(envelope.correlation_id, correlation_id);
    }

    #[test]
    fn wrap_mints_distinct_event_ids() {
        let correlation_id = Uuid::new_v4();
        let event = TestEvent {
            booking_id: Uuid::new_v4(),
            amount_cents: 1,
        };

        let a = EventEnvelope::wrap(&event, correlation_id, Utc::now()).unwrap();
        let b = EventEnvelope::wrap(&event, correlation_id, Utc::now()).unwrap();

        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn wire_roundtrip_preserves_everything() {
        let event = TestEvent {
            booking_id: Uuid::new_v4(),
            amount_cents: 999,
        };
        let envelope = EventEnvelope::wrap(&event, Uuid::new_v4(), Utc::now()).unwrap();

        let bytes = envelope.to_bytes().unwrap();
        let back = EventEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(envelope, back);
        assert_eq!(back.decode::<TestEvent>().unwrap(), event);
    }

    #[test]
    fn wire_form_is_a_json_object() {
        let event = TestEvent {
            booking_id: Uuid::new_v4(),
            amount_cents: 7,
        };
        let envelope = EventEnvelope::wrap(&event, Uuid::new_v4(), Utc::now()).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert!(value.get("event_id").is_some());
        assert!(value.get("correlation_id").is_some());
        assert!(value.get("event_name").is_some());
        assert!(value.get("timestamp").is_some());
        assert!(value.get("data").is_some());
    }

    #[test]
    fn malformed_bytes_are_a_permanent_defect() {
        let result = EventEnvelope::from_bytes(b"not json at all");
        assert!(matches!(
            result,
            Err(EnvelopeError::DeserializationError(_))
        ));
    }

    #[test]
    fn decode_into_wrong_type_fails() {
        #[derive(Debug, Deserialize)]
        struct Other {
            #[allow(dead_code)]
            completely_different: String,
        }

        let event = TestEvent {
            booking_id: Uuid::new_v4(),
            amount_cents: 7,
        };
        let envelope = EventEnvelope::wrap(&event, Uuid::new_v4(), Utc::now()).unwrap();

        assert!(envelope.decode::<Other>().is_err());
    }
}
