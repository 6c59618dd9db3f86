//! # Steadfast Runtime
//!
//! The loops and pipelines of the reliable event-delivery layer:
//!
//! - [`retry`]: bounded exponential-backoff pipelines with jitter — the
//!   publish pipeline and the more patient connection pipeline are both
//!   presets of one [`RetryPolicy`](retry::RetryPolicy)
//! - [`connection`]: lazy, self-healing broker connections
//! - [`publisher`]: one broker send wrapped in the publish pipeline
//! - [`relay`]: the per-service polling loop that drains an outbox store
//! - [`consumer`]: the per-queue message loop with requeue bookkeeping and
//!   dead-lettering
//! - [`metrics`]: Prometheus registration and exporter
//!
//! Each service instance runs one relay task and one consumer task per
//! consumed queue, as independent tokio tasks sharing no mutable state
//! except the durable store. Cross-task coordination goes through the
//! store's transactional guarantees, not in-process locks. Shutdown is
//! cooperative via `tokio::sync::watch` channels: flipping the signal stops
//! new retry attempts from being scheduled while attempts already in flight
//! finish.
//!
//! # Example
//!
//! ```rust,ignore
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! let relay = OutboxRelay::new("payment", store, publisher, SystemClock, RelayConfig::default());
//! let consumer = ResilientConsumer::new(
//!     "inventory.item-reserved",
//!     queue,
//!     dead_letters,
//!     handler,
//!     SystemClock,
//!     ConsumerConfig::default(),
//! );
//!
//! tokio::spawn(async move { relay.run(shutdown_rx.clone()).await });
//! tokio::spawn(async move { consumer.run(shutdown_rx).await });
//! // ... on SIGTERM:
//! let _ = shutdown_tx.send(true);
//! ```

pub mod connection;
pub mod consumer;
pub mod metrics;
pub mod publisher;
pub mod relay;
pub mod retry;

pub use connection::{ConnectionManager, Connector};
pub use consumer::{ConsumerConfig, EventHandler, FnHandler, ResilientConsumer, handler_fn};
pub use publisher::ResilientPublisher;
pub use relay::{OutboxRelay, RelayConfig};
pub use retry::{
    PipelineError, RetryPolicy, retry_with_backoff, retry_with_backoff_until,
    retry_with_predicate,
};
