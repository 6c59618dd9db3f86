//! # Steadfast Core
//!
//! Core traits and types for the Steadfast reliable event-delivery and
//! saga-coordination layer.
//!
//! Services built on this layer share one shape: a business mutation and its
//! domain event commit in the same unit of work (the outbox), a relay drains
//! the outbox through a retrying publish pipeline, and peer services consume
//! the events idempotently, requeueing bounded-retryable failures and
//! dead-lettering the rest.
//!
//! ```text
//! business op ──► Outbox Store ──► Outbox Relay ──► Publish Pipeline ──► broker
//!    (same transaction)                                                    │
//!                                                                          ▼
//!                 Outbox Store ◄── handler ◄── Resilient Consumer ◄── peer queue
//!                 (next saga step)     │
//!                                      └──► Dead-Letter Sink (on exhaustion)
//! ```
//!
//! This crate holds the leaf data types and the seams:
//!
//! - [`envelope`]: the immutable [`EventEnvelope`](envelope::EventEnvelope)
//!   wire format and the [`DomainEvent`](envelope::DomainEvent) trait
//! - [`queue`]: the broker abstraction — durable queues, explicit
//!   ack/requeue/reject settlement, diagnostic message properties
//! - [`outbox`]: the per-service durable log of to-be-published events
//! - [`dead_letter`]: the terminal sink for messages that exhausted their
//!   requeue budget
//! - [`environment`]: injected dependencies (clock)
//!
//! The loops that tie these together (relay, pipelines, consumer) live in
//! `steadfast-runtime`; concrete stores and brokers in `steadfast-postgres`
//! and `steadfast-redpanda`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;

pub mod dead_letter;
pub mod envelope;
pub mod outbox;
pub mod queue;

/// Environment module - dependency injection traits.
///
/// All external dependencies of the delivery layer are abstracted behind
/// traits and injected, so tests run deterministic and fast.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability.
    ///
    /// Production code uses [`SystemClock`]; tests use the fixed clock from
    /// `steadfast-testing`.
    pub trait Clock: Send + Sync {
        /// Get the current time.
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock implementation of [`Clock`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
