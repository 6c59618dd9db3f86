//! # Steadfast Postgres
//!
//! `PostgreSQL` implementations of the delivery layer's two durable stores:
//!
//! - [`PgOutboxStore`] — the per-service outbox, with transactional append
//! - [`PgDeadLetterStore`] — the dead-letter sink
//!
//! Both live in whatever database the owning service already uses; the
//! schemas are documented on the respective modules. No specific engine is
//! mandated by the layer itself — the traits in `steadfast-core` are the
//! contract, and `steadfast-testing` ships in-memory twins.
//!
//! # Example
//!
//! ```no_run
//! use steadfast_postgres::PgOutboxStore;
//! use steadfast_core::envelope::{DomainEvent, EventEnvelope};
//!
//! # #[derive(serde::Serialize)]
//! # struct BookingRequested;
//! # impl DomainEvent for BookingRequested {
//! #     fn event_name(&self) -> &'static str { "booking.requested" }
//! # }
//! # async fn example(pool: sqlx::PgPool, envelope: EventEnvelope) -> Result<(), Box<dyn std::error::Error>> {
//! let mut tx = pool.begin().await?;
//! // ... the business mutation, on the same transaction ...
//! PgOutboxStore::append(&mut tx, &envelope).await?;
//! tx.commit().await?; // mutation and record become durable together
//! # Ok(())
//! # }
//! ```

pub mod dead_letter_store;
pub mod outbox_store;

pub use dead_letter_store::PgDeadLetterStore;
pub use outbox_store::PgOutboxStore;
