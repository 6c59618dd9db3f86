//! The payment service: charge-once semantics over an injectable gateway.
//!
//! Reacts to `inventory.item-reserved` by charging the booking through a
//! [`PaymentGateway`] and emitting `payment.succeeded` or `payment.failed`.
//! A declined charge is an expected business outcome — the handler emits
//! the failure event and returns `Ok`, which acknowledges the message.
//!
//! The ledger keys one outcome per booking, so a redelivered
//! `inventory.item-reserved` never produces a second charge.

use crate::events::SagaEvent;
use std::collections::HashMap;
use std::sync::Mutex;
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::environment::Clock;
use steadfast_core::outbox::OutboxError;
use steadfast_testing::InMemoryOutboxStore;
use thiserror::Error;
use uuid::Uuid;

/// Errors from payment operations.
#[derive(Error, Debug)]
pub enum PaymentError {
    /// The outbox append failed; the mutation was rolled back.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// A declined charge, with the reason the gateway gave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentDeclined {
    /// Gateway-supplied reason, e.g. "card declined".
    pub reason: String,
}

/// Seam to the external payment provider.
///
/// Injected so tests (and the demo deployment) can decide outcomes
/// deterministically.
pub trait PaymentGateway: Send + Sync {
    /// Attempt one charge. `Err` is a decline — an expected outcome, not a
    /// transport failure.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentDeclined`] when the gateway refuses the charge.
    fn charge(&self, booking_id: Uuid, amount_cents: u64) -> Result<(), PaymentDeclined>;
}

/// Gateway that approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

impl PaymentGateway for ApproveAll {
    fn charge(&self, _booking_id: Uuid, _amount_cents: u64) -> Result<(), PaymentDeclined> {
        Ok(())
    }
}

/// Gateway that declines everything with a fixed reason.
#[derive(Debug, Clone)]
pub struct DeclineAll {
    /// The reason returned for every charge.
    pub reason: String,
}

impl PaymentGateway for DeclineAll {
    fn charge(&self, _booking_id: Uuid, _amount_cents: u64) -> Result<(), PaymentDeclined> {
        Err(PaymentDeclined {
            reason: self.reason.clone(),
        })
    }
}

/// Gateway that declines charges above a limit.
#[derive(Debug, Clone, Copy)]
pub struct DeclineAbove {
    /// Largest amount that will be approved.
    pub limit_cents: u64,
}

impl PaymentGateway for DeclineAbove {
    fn charge(&self, _booking_id: Uuid, amount_cents: u64) -> Result<(), PaymentDeclined> {
        if amount_cents > self.limit_cents {
            Err(PaymentDeclined {
                reason: "amount over limit".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Recorded outcome of a booking's single charge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The gateway approved the charge.
    Charged {
        /// The charged amount.
        amount_cents: u64,
    },
    /// The gateway declined the charge.
    Declined {
        /// Why.
        reason: String,
    },
}

/// Charge-once payment processor.
pub struct PaymentService<G, C> {
    ledger: Mutex<HashMap<Uuid, ChargeOutcome>>,
    outbox: InMemoryOutboxStore,
    gateway: G,
    clock: C,
}

impl<G: PaymentGateway, C: Clock> PaymentService<G, C> {
    /// Create the service around its outbox store and gateway.
    pub fn new(outbox: InMemoryOutboxStore, gateway: G, clock: C) -> Self {
        Self {
            ledger: Mutex::new(HashMap::new()),
            outbox,
            gateway,
            clock,
        }
    }

    /// The service's outbox, for wiring up its relay.
    #[must_use]
    pub fn outbox(&self) -> InMemoryOutboxStore {
        self.outbox.clone()
    }

    /// Recorded outcome for a booking, if a charge was ever attempted.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn outcome(&self, booking_id: Uuid) -> Option<ChargeOutcome> {
        self.ledger.lock().unwrap().get(&booking_id).cloned()
    }

    /// Reaction to `inventory.item-reserved`: charge exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Outbox`] only when the outcome event cannot
    /// be staged; a decline is a normal branch that succeeds.
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn handle_item_reserved(
        &self,
        booking_id: Uuid,
        amount_cents: u64,
        correlation_id: Uuid,
    ) -> Result<(), PaymentError> {
        let mut ledger = self.ledger.lock().unwrap();

        // Redelivery: the outcome is already recorded and its event is
        // already in the outbox. No double charge.
        if ledger.contains_key(&booking_id) {
            tracing::debug!(
                booking_id = %booking_id,
                correlation_id = %correlation_id,
                "Charge already settled, ignoring redelivery"
            );
            return Ok(());
        }

        match self.gateway.charge(booking_id, amount_cents) {
            Ok(()) => {
                self.emit(
                    &SagaEvent::PaymentSucceeded {
                        booking_id,
                        amount_cents,
                    },
                    correlation_id,
                )?;
                ledger.insert(booking_id, ChargeOutcome::Charged { amount_cents });
                drop(ledger);

                tracing::info!(
                    booking_id = %booking_id,
                    correlation_id = %correlation_id,
                    amount_cents,
                    "Payment succeeded"
                );
            }
            Err(declined) => {
                self.emit(
                    &SagaEvent::PaymentFailed {
                        booking_id,
                        reason: declined.reason.clone(),
                    },
                    correlation_id,
                )?;
                ledger.insert(
                    booking_id,
                    ChargeOutcome::Declined {
                        reason: declined.reason.clone(),
                    },
                );
                drop(ledger);

                tracing::info!(
                    booking_id = %booking_id,
                    correlation_id = %correlation_id,
                    reason = %declined.reason,
                    "Payment failed"
                );
            }
        }

        Ok(())
    }

    fn emit(&self, event: &SagaEvent, correlation_id: Uuid) -> Result<(), PaymentError> {
        let envelope = EventEnvelope::wrap(event, correlation_id, self.clock.now())
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;
        self.outbox.append(&envelope)?;
        Ok(())
    }
}
