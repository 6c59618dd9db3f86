//! The booking service: saga entry point and terminal-state owner.
//!
//! `begin_booking` is where a saga instance starts: it mints the
//! correlation id, creates the aggregate in `Pending`, and appends the
//! `BookingRequested` event to the outbox — all in one unit of work, so the
//! event exists iff the booking does.
//!
//! The service then reacts to the outcomes reported by its peers:
//!
//! - `inventory.reservation-failed` → `Cancelled(reason)`
//! - `payment.succeeded` → `Confirmed`
//! - `payment.failed` → `Cancelled(reason)`
//!
//! Transitions into a terminal state are idempotent no-ops once the
//! aggregate is already terminal: events may arrive more than once or out
//! of the expected order, and a late `PaymentFailed` after another path
//! already cancelled the booking must change nothing.

use crate::events::SagaEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::environment::Clock;
use steadfast_core::outbox::OutboxError;
use steadfast_testing::InMemoryOutboxStore;
use thiserror::Error;
use uuid::Uuid;

/// Errors from booking operations.
#[derive(Error, Debug)]
pub enum BookingError {
    /// The request failed validation; nothing was recorded.
    #[error("Invalid booking request: {0}")]
    Invalid(String),

    /// No aggregate with this id.
    #[error("Unknown booking: {0}")]
    UnknownBooking(Uuid),

    /// The outbox append failed; the mutation was rolled back.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Saga aggregate status. `Confirmed` and `Cancelled` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingStatus {
    /// Waiting for the saga to finish.
    Pending,
    /// Reservation and payment both succeeded.
    Confirmed,
    /// A step failed; compensations (if any) have been requested.
    Cancelled {
        /// Why the booking was cancelled.
        reason: String,
    },
}

impl BookingStatus {
    /// Whether this status accepts no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The booking aggregate.
#[derive(Debug, Clone)]
pub struct Booking {
    /// Aggregate id, also the saga's business key.
    pub id: Uuid,
    /// Saga instance id, stamped on every event and log line.
    pub correlation_id: Uuid,
    /// The requested item.
    pub item_id: String,
    /// The amount to charge.
    pub amount_cents: u64,
    /// Current saga status.
    pub status: BookingStatus,
}

/// Saga entry point and owner of the booking aggregate.
pub struct BookingService<C> {
    bookings: Mutex<HashMap<Uuid, Booking>>,
    outbox: InMemoryOutboxStore,
    clock: C,
}

impl<C: Clock> BookingService<C> {
    /// Create the service around its outbox store.
    pub fn new(outbox: InMemoryOutboxStore, clock: C) -> Self {
        Self {
            bookings: Mutex::new(HashMap::new()),
            outbox,
            clock,
        }
    }

    /// The service's outbox, for wiring up its relay.
    #[must_use]
    pub fn outbox(&self) -> InMemoryOutboxStore {
        self.outbox.clone()
    }

    /// Start a saga instance: create the aggregate and stage
    /// `BookingRequested`, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Invalid`] for a zero amount or empty item —
    /// in which case nothing is recorded, neither booking nor event.
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn begin_booking(
        &self,
        item_id: &str,
        amount_cents: u64,
    ) -> Result<Booking, BookingError> {
        if item_id.is_empty() {
            return Err(BookingError::Invalid("item id must not be empty".into()));
        }
        if amount_cents == 0 {
            return Err(BookingError::Invalid("amount must be positive".into()));
        }

        let booking = Booking {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            item_id: item_id.to_string(),
            amount_cents,
            status: BookingStatus::Pending,
        };

        // One lock spans the mutation and the append: the unit of work.
        let mut bookings = self.bookings.lock().unwrap();

        let envelope = EventEnvelope::wrap(
            &SagaEvent::BookingRequested {
                booking_id: booking.id,
                item_id: booking.item_id.clone(),
                amount_cents,
            },
            booking.correlation_id,
            self.clock.now(),
        )
        .map_err(|e| OutboxError::StorageError(e.to_string()))?;
        self.outbox.append(&envelope)?;

        bookings.insert(booking.id, booking.clone());
        drop(bookings);

        tracing::info!(
            booking_id = %booking.id,
            correlation_id = %booking.correlation_id,
            item_id = %booking.item_id,
            "Booking requested"
        );

        Ok(booking)
    }

    /// Current status of a booking.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn status(&self, booking_id: Uuid) -> Option<BookingStatus> {
        self.bookings
            .lock()
            .unwrap()
            .get(&booking_id)
            .map(|b| b.status.clone())
    }

    /// Reaction to `inventory.reservation-failed`.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::UnknownBooking`] if the aggregate does not
    /// exist (the handler's retry pipeline absorbs ordering races).
    pub fn apply_reservation_failed(
        &self,
        booking_id: Uuid,
        reason: &str,
        correlation_id: Uuid,
    ) -> Result<(), BookingError> {
        self.cancel(booking_id, reason, correlation_id)
    }

    /// Reaction to `payment.succeeded`.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::UnknownBooking`] if the aggregate does not
    /// exist.
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn apply_payment_succeeded(
        &self,
        booking_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<(), BookingError> {
        let mut bookings = self.bookings.lock().unwrap();
        let booking = bookings
            .get_mut(&booking_id)
            .ok_or(BookingError::UnknownBooking(booking_id))?;

        if booking.status.is_terminal() {
            tracing::debug!(
                booking_id = %booking_id,
                correlation_id = %correlation_id,
                status = ?booking.status,
                "Already terminal, ignoring payment success"
            );
            return Ok(());
        }

        booking.status = BookingStatus::Confirmed;
        drop(bookings);

        tracing::info!(
            booking_id = %booking_id,
            correlation_id = %correlation_id,
            "Booking confirmed"
        );
        Ok(())
    }

    /// Reaction to `payment.failed`. The inventory service releases the
    /// reservation on the same event; this side only cancels.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::UnknownBooking`] if the aggregate does not
    /// exist.
    pub fn apply_payment_failed(
        &self,
        booking_id: Uuid,
        reason: &str,
        correlation_id: Uuid,
    ) -> Result<(), BookingError> {
        self.cancel(booking_id, reason, correlation_id)
    }

    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    fn cancel(
        &self,
        booking_id: Uuid,
        reason: &str,
        correlation_id: Uuid,
    ) -> Result<(), BookingError> {
        let mut bookings = self.bookings.lock().unwrap();
        let booking = bookings
            .get_mut(&booking_id)
            .ok_or(BookingError::UnknownBooking(booking_id))?;

        if booking.status.is_terminal() {
            tracing::debug!(
                booking_id = %booking_id,
                correlation_id = %correlation_id,
                status = ?booking.status,
                "Already terminal, ignoring cancellation"
            );
            return Ok(());
        }

        booking.status = BookingStatus::Cancelled {
            reason: reason.to_string(),
        };
        drop(bookings);

        tracing::info!(
            booking_id = %booking_id,
            correlation_id = %correlation_id,
            reason = reason,
            "Booking cancelled"
        );
        Ok(())
    }
}
