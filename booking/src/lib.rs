//! # Steadfast Booking
//!
//! A choreographed booking saga across three services — booking, inventory,
//! payment — built entirely on the Steadfast delivery layer. There is no
//! central orchestrator: each service reacts to the events it understands
//! and, where a reaction changes state, stages the next event in its own
//! outbox inside the same unit of work.
//!
//! # Flow
//!
//! ```text
//! begin_booking (mints correlation id, booking → PENDING)
//!      │ booking.requested
//!      ▼
//! inventory ── item-reserved ──► payment ── payment.succeeded ──► CONFIRMED
//!      │                            │
//!      │ reservation-failed         │ payment.failed
//!      ▼                            ▼
//!  CANCELLED("capacity exceeded")   ├─► booking: CANCELLED(reason)
//!                                   └─► inventory: reservation released
//! ```
//!
//! Every handler checks the aggregate's current state first: duplicated or
//! out-of-order deliveries of terminal events are no-ops, never errors, and
//! never produce a second compensation.
//!
//! # Example
//!
//! ```
//! use steadfast_booking::deployment::{DeploymentConfig, SagaDeployment};
//! use steadfast_booking::payment::ApproveAll;
//! use steadfast_core::environment::SystemClock;
//! use steadfast_testing::InMemoryQueue;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = Arc::new(InMemoryQueue::new());
//! let deployment = SagaDeployment::start(
//!     &queue,
//!     ApproveAll,
//!     SystemClock,
//!     &DeploymentConfig::default(),
//! );
//!
//! deployment.inventory.add_capacity("room-101", 5);
//! let booking = deployment.booking.begin_booking("room-101", 12_500).unwrap();
//! # let _ = booking;
//! # deployment.shutdown().await;
//! # }
//! ```

pub mod booking;
pub mod deployment;
pub mod events;
pub mod handlers;
pub mod inventory;
pub mod payment;

pub use booking::{Booking, BookingService, BookingStatus};
pub use deployment::{DeploymentConfig, SagaDeployment};
pub use events::SagaEvent;
pub use inventory::InventoryService;
pub use payment::{ApproveAll, DeclineAbove, DeclineAll, PaymentGateway, PaymentService};
