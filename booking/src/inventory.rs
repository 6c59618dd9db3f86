//! The inventory service: reservation bookkeeping and its compensation.
//!
//! Reacts to `booking.requested` by reserving capacity and emitting either
//! `inventory.item-reserved` or `inventory.reservation-failed` — the latter
//! is an expected business outcome, not an error. Reacts to
//! `payment.failed` by releasing the reservation (the compensating action)
//! and emitting `inventory.reservation-released`.
//!
//! Both handlers are idempotent: a redelivered `booking.requested` for an
//! already-reserved booking changes nothing, and a second `payment.failed`
//! finds no reservation to release and emits no duplicate compensation.

use crate::events::SagaEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::environment::Clock;
use steadfast_core::outbox::OutboxError;
use steadfast_testing::InMemoryOutboxStore;
use thiserror::Error;
use uuid::Uuid;

/// Errors from inventory operations.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// The outbox append failed; the mutation was rolled back.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

#[derive(Default)]
struct InventoryState {
    /// Item id → units still available.
    capacity: HashMap<String, u32>,
    /// Booking id → reserved item. One reservation per booking.
    reservations: HashMap<Uuid, String>,
}

/// Capacity pool plus reservation ledger.
pub struct InventoryService<C> {
    state: Mutex<InventoryState>,
    outbox: InMemoryOutboxStore,
    clock: C,
}

impl<C: Clock> InventoryService<C> {
    /// Create the service around its outbox store.
    pub fn new(outbox: InMemoryOutboxStore, clock: C) -> Self {
        Self {
            state: Mutex::new(InventoryState::default()),
            outbox,
            clock,
        }
    }

    /// The service's outbox, for wiring up its relay.
    #[must_use]
    pub fn outbox(&self) -> InMemoryOutboxStore {
        self.outbox.clone()
    }

    /// Seed capacity for an item.
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn add_capacity(&self, item_id: &str, quantity: u32) {
        let mut state = self.state.lock().unwrap();
        *state.capacity.entry(item_id.to_string()).or_insert(0) += quantity;
    }

    /// Units currently available for an item.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn available(&self, item_id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .capacity
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a booking currently holds a reservation.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn has_reservation(&self, booking_id: Uuid) -> bool {
        self.state
            .lock()
            .unwrap()
            .reservations
            .contains_key(&booking_id)
    }

    /// Reaction to `booking.requested`: reserve, or report the shortage.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Outbox`] only when the event cannot be
    /// staged; "capacity exceeded" is a normal branch that succeeds.
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn handle_booking_requested(
        &self,
        booking_id: Uuid,
        item_id: &str,
        amount_cents: u64,
        correlation_id: Uuid,
    ) -> Result<(), InventoryError> {
        let mut state = self.state.lock().unwrap();

        // Redelivery of a request we already answered: no-op. The answer
        // event is already durable in the outbox.
        if state.reservations.contains_key(&booking_id) {
            tracing::debug!(
                booking_id = %booking_id,
                correlation_id = %correlation_id,
                "Reservation already held, ignoring redelivery"
            );
            return Ok(());
        }

        let available = state.capacity.get(item_id).copied().unwrap_or(0);
        if available == 0 {
            // Expected business outcome: answer with the compensating
            // branch, in the same unit of work as (no) state change.
            self.emit(
                &SagaEvent::ItemReservationFailed {
                    booking_id,
                    item_id: item_id.to_string(),
                    reason: "capacity exceeded".to_string(),
                },
                correlation_id,
            )?;
            drop(state);

            tracing::info!(
                booking_id = %booking_id,
                correlation_id = %correlation_id,
                item_id = item_id,
                "Reservation failed: capacity exceeded"
            );
            return Ok(());
        }

        self.emit(
            &SagaEvent::ItemReserved {
                booking_id,
                item_id: item_id.to_string(),
                amount_cents,
            },
            correlation_id,
        )?;
        if let Some(units) = state.capacity.get_mut(item_id) {
            *units -= 1;
        }
        state.reservations.insert(booking_id, item_id.to_string());
        drop(state);

        tracing::info!(
            booking_id = %booking_id,
            correlation_id = %correlation_id,
            item_id = item_id,
            "Item reserved"
        );
        Ok(())
    }

    /// Reaction to `payment.failed`: the compensating release.
    ///
    /// Finding no reservation is not an error — the compensation already
    /// ran, or the reservation never succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Outbox`] only when the release event
    /// cannot be staged.
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn handle_payment_failed(
        &self,
        booking_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<(), InventoryError> {
        let mut state = self.state.lock().unwrap();

        let Some(item_id) = state.reservations.remove(&booking_id) else {
            tracing::debug!(
                booking_id = %booking_id,
                correlation_id = %correlation_id,
                "No reservation to release, ignoring"
            );
            return Ok(());
        };

        self.emit(
            &SagaEvent::ReservationReleased {
                booking_id,
                item_id: item_id.clone(),
            },
            correlation_id,
        )?;
        *state.capacity.entry(item_id.clone()).or_insert(0) += 1;
        drop(state);

        tracing::info!(
            booking_id = %booking_id,
            correlation_id = %correlation_id,
            item_id = %item_id,
            "Reservation released"
        );
        Ok(())
    }

    fn emit(&self, event: &SagaEvent, correlation_id: Uuid) -> Result<(), InventoryError> {
        let envelope = EventEnvelope::wrap(event, correlation_id, self.clock.now())
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;
        self.outbox.append(&envelope)?;
        Ok(())
    }
}
