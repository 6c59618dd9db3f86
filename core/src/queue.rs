//! Message-queue abstraction for broker-backed event delivery.
//!
//! This module defines the seam between the delivery layer and the broker:
//! durable queues (one per event type), publish with broker acknowledgment,
//! and consume with explicit per-message settlement (ack, requeue, reject).
//!
//! # Delivery semantics
//!
//! - **At-least-once**: a message is removed from its queue only when the
//!   consumer settles it with [`Disposition::Ack`]. A crash before settling
//!   redelivers the message, so handlers must be idempotent.
//! - **One in flight**: implementations deliver at most one unsettled
//!   message per consumed queue. That yields strict per-queue ordering and
//!   keeps retry bookkeeping simple, at the cost of parallel throughput.
//! - **Self-describing retries**: the requeue budget travels in
//!   [`MessageProps`] (`retry_count`, `first_attempt`) rather than in any
//!   consumer-process memory, so a consumer restart cannot reset it.
//!
//! # Implementations
//!
//! - `InMemoryQueue` (steadfast-testing) — deterministic, for tests
//! - `RedpandaQueue` (steadfast-redpanda) — Kafka-protocol brokers; queue
//!   maps to topic, ack to offset commit, requeue to re-publish with the
//!   counter incremented followed by a commit of the original

use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Content-type marker carried by every message (the envelope wire form).
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Failed to reach or authenticate with the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation did not complete within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Failed to publish a message to a queue.
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// The destination queue.
        queue: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to start consuming from a queue.
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// The queue that failed.
        queue: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to settle a delivery (the consumer side may be gone).
    #[error("Settle failed: {0}")]
    SettleFailed(String),

    /// Network or transport error detected mid-stream.
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl QueueError {
    /// Whether this failure is worth retrying.
    ///
    /// Connection-level failures, timeouts and transport hiccups are
    /// transient: the broker may simply be unreachable right now. Everything
    /// else propagates immediately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::TransportError(_)
        )
    }
}

/// Message properties accompanying a payload on the wire.
///
/// These are broker-level headers, not part of the event envelope: the
/// envelope is immutable, while properties accumulate delivery diagnostics
/// (`retry_count`, and for dead-lettered copies `error_message` and
/// `original_queue`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProps {
    /// Broker message identifier (distinct from the envelope's `event_id`).
    pub message_id: Uuid,

    /// Content-type marker, [`CONTENT_TYPE_JSON`] for envelopes.
    pub content_type: String,

    /// Durable/persistent delivery flag.
    pub persistent: bool,

    /// How many times this message has been requeued.
    pub retry_count: u32,

    /// When the message was first published (preserved across requeues).
    pub first_attempt: DateTime<Utc>,

    /// Last handler error, set only on dead-lettered copies.
    pub error_message: Option<String>,

    /// The queue the message originally arrived on, set only on
    /// dead-lettered copies.
    pub original_queue: Option<String>,
}

impl MessageProps {
    /// Properties for a freshly published message.
    #[must_use]
    pub const fn new(message_id: Uuid, first_attempt: DateTime<Utc>) -> Self {
        Self {
            message_id,
            content_type: String::new(),
            persistent: true,
            retry_count: 0,
            first_attempt,
            error_message: None,
            original_queue: None,
        }
    }

    /// Properties for a freshly published JSON envelope.
    #[must_use]
    pub fn json(message_id: Uuid, first_attempt: DateTime<Utc>) -> Self {
        let mut props = Self::new(message_id, first_attempt);
        props.content_type = CONTENT_TYPE_JSON.to_string();
        props
    }

    /// Properties for the requeued copy of this message: the retry counter
    /// is incremented, `first_attempt` is preserved.
    #[must_use]
    pub fn requeued(&self) -> Self {
        let mut props = self.clone();
        props.retry_count = self.retry_count.saturating_add(1);
        props
    }

    /// Properties for the dead-lettered copy of this message, carrying the
    /// final error and the originating queue.
    #[must_use]
    pub fn dead_lettered(&self, error_message: &str, original_queue: &str) -> Self {
        let mut props = self.clone();
        props.error_message = Some(error_message.to_string());
        props.original_queue = Some(original_queue.to_string());
        props
    }
}

/// A payload plus its wire properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker-level message properties.
    pub props: MessageProps,
    /// The message body (a serialized [`EventEnvelope`]).
    ///
    /// [`EventEnvelope`]: crate::envelope::EventEnvelope
    pub payload: Vec<u8>,
}

/// Name of the terminal holding queue for messages from `queue` that
/// exhausted their requeue budget.
#[must_use]
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}.dead-letter")
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing succeeded; remove the message from the queue.
    Ack,
    /// Processing failed but the requeue budget is not exhausted; put the
    /// message back with its retry counter incremented.
    Requeue,
    /// Permanent defect or exhausted budget; remove the message without
    /// redelivery.
    Reject,
}

/// Settlement handle for a single delivery.
///
/// Consumed on use: a delivery is settled exactly once.
pub trait Receipt: Send {
    /// Settle the delivery with the given disposition.
    fn settle(
        self: Box<Self>,
        disposition: Disposition,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>;
}

/// A single in-flight message handed to a consumer.
pub struct Delivery {
    /// The queue this message arrived on.
    pub queue: String,
    /// The message itself.
    pub message: QueueMessage,
    receipt: Box<dyn Receipt>,
}

impl Delivery {
    /// Assemble a delivery from its parts (called by queue implementations).
    #[must_use]
    pub fn new(queue: String, message: QueueMessage, receipt: Box<dyn Receipt>) -> Self {
        Self {
            queue,
            message,
            receipt,
        }
    }

    /// Settle this delivery, consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SettleFailed`] if the consuming side of the
    /// queue is no longer reachable.
    pub async fn settle(self, disposition: Disposition) -> Result<(), QueueError> {
        self.receipt.settle(disposition).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("message_id", &self.message.props.message_id)
            .field("retry_count", &self.message.props.retry_count)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a consumed queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, QueueError>> + Send>>;

/// Trait for broker-backed (or in-memory) message queues.
///
/// # Dyn Compatibility
///
/// Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
/// that queues can be held as `Arc<dyn MessageQueue>` by relays, consumers
/// and saga services alike.
pub trait MessageQueue: Send + Sync {
    /// Publish a message to a durable queue.
    ///
    /// Resolves only once the broker has acknowledged the write; a resolved
    /// `Ok` means the message is durably queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] (or a transient connection
    /// error) if the message could not be durably queued.
    fn publish(
        &self,
        queue: &str,
        message: QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Start consuming a queue, yielding at most one unsettled delivery at
    /// a time.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConsumeFailed`] if the subscription cannot be
    /// established.
    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>>;
}
