//! Resilient consumer: per-queue message loop with bounded reprocessing.
//!
//! Every inbound message walks a small state machine:
//!
//! ```text
//! Received ──► Rejected(permanent)      payload is not a valid envelope
//!     │
//!     ▼
//! Processing ──► Acked                  handler succeeded (possibly after
//!     │                                 in-process retries)
//!     ├──────► Requeued                 internal retries exhausted, requeue
//!     │                                 budget remains
//!     └──────► DeadLettered             requeue budget exhausted: durable
//!                                       record + copy on <queue>.dead-letter
//! ```
//!
//! The handler runs under an internal retry pipeline
//! ([`RetryPolicy::handler`]) that retries the idempotent business operation
//! in-process. Only when that pipeline is exhausted does the message go back
//! to the broker, with its requeue counter — carried in the message's own
//! properties, so a consumer restart cannot reset the budget — incremented.
//! Once the counter reaches `max_requeue_attempts` the message is settled
//! without requeue and a [`DeadLetterRecord`] captures the accumulated
//! diagnostics.
//!
//! Handlers must tolerate re-delivery: check current aggregate state first
//! and no-op when it is already terminal. An expected business outcome
//! ("insufficient capacity") is not an error here — the handler emits a
//! compensating event and returns `Ok`.

use crate::retry::{PipelineError, RetryPolicy, retry_with_backoff};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::environment::Clock;
use steadfast_core::dead_letter::{DeadLetterRecord, DeadLetterStore};
use steadfast_core::queue::{
    Delivery, Disposition, MessageQueue, dead_letter_queue_name,
};
use tokio::sync::watch;
use tokio::time::sleep;

/// Application callback invoked for each decoded envelope.
///
/// Returns `anyhow::Result` because this is the application boundary;
/// whatever fails inside a handler is diagnostic payload, not a typed
/// branch this layer acts on.
pub trait EventHandler: Send + Sync {
    /// Process one envelope. Must be idempotent under re-delivery.
    fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

impl<T: EventHandler + ?Sized> EventHandler for Box<T> {
    fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        (**self).handle(envelope)
    }
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin((self.0)(envelope))
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

/// Externally supplied consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Requeues allowed per message before it is dead-lettered.
    pub max_requeue_attempts: u32,
    /// Pause before a requeue is requested.
    pub requeue_delay: Duration,
    /// Policy for the internal (in-process) handler retry pipeline.
    pub handler_policy: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_requeue_attempts: 3,
            requeue_delay: Duration::from_millis(500),
            handler_policy: RetryPolicy::handler(),
        }
    }
}

/// Per-queue message loop: decode, handle under retry, ack / requeue /
/// dead-letter.
///
/// Deliveries are processed one at a time (the queue abstraction yields at
/// most one unsettled message), which gives strict per-queue ordering.
pub struct ResilientConsumer<Q, D, H, C> {
    queue: Arc<Q>,
    dead_letters: Arc<D>,
    handler: H,
    clock: C,
    queue_name: String,
    config: ConsumerConfig,
}

impl<Q, D, H, C> ResilientConsumer<Q, D, H, C>
where
    Q: MessageQueue,
    D: DeadLetterStore,
    H: EventHandler,
    C: Clock,
{
    /// Create a consumer for one queue.
    pub fn new(
        queue_name: impl Into<String>,
        queue: Arc<Q>,
        dead_letters: Arc<D>,
        handler: H,
        clock: C,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            dead_letters,
            handler,
            clock,
            queue_name: queue_name.into(),
            config,
        }
    }

    /// Consume until `shutdown` flips true. A message already being
    /// processed finishes before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut deliveries = match self.queue.consume(&self.queue_name).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(
                    queue = %self.queue_name,
                    error = %err,
                    "Failed to start consuming"
                );
                return;
            }
        };

        tracing::info!(
            queue = %self.queue_name,
            max_requeue_attempts = self.config.max_requeue_attempts,
            "Consumer started"
        );

        loop {
            tokio::select! {
                next = deliveries.next() => {
                    match next {
                        Some(Ok(delivery)) => self.process(delivery).await,
                        Some(Err(err)) => {
                            tracing::warn!(
                                queue = %self.queue_name,
                                error = %err,
                                "Transport error on delivery stream"
                            );
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue_name, "Consumer stopped");
    }

    /// Walk one delivery through the state machine.
    async fn process(&self, delivery: Delivery) {
        // Malformed payload: permanent defect, rejected without requeue.
        let envelope = match EventEnvelope::from_bytes(&delivery.message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                metrics::counter!("consumer.rejected", "queue" => self.queue_name.clone())
                    .increment(1);
                tracing::error!(
                    queue = %self.queue_name,
                    message_id = %delivery.message.props.message_id,
                    error = %err,
                    "Rejecting undecodable message"
                );
                self.settle(delivery, Disposition::Reject).await;
                return;
            }
        };

        let outcome = retry_with_backoff(&self.config.handler_policy, || {
            self.handler.handle(envelope.clone())
        })
        .await;

        match outcome {
            Ok(()) => {
                metrics::counter!("consumer.handled", "queue" => self.queue_name.clone())
                    .increment(1);
                tracing::debug!(
                    queue = %self.queue_name,
                    correlation_id = %envelope.correlation_id,
                    event_id = %envelope.event_id,
                    "Message handled"
                );
                self.settle(delivery, Disposition::Ack).await;
            }
            Err(err) => self.handle_exhaustion(delivery, &envelope, &err).await,
        }
    }

    /// Internal pipeline exhausted: requeue while the budget allows,
    /// dead-letter once it does not.
    async fn handle_exhaustion(
        &self,
        delivery: Delivery,
        envelope: &EventEnvelope,
        error: &PipelineError<anyhow::Error>,
    ) {
        let requeues_so_far = delivery.message.props.retry_count;

        if requeues_so_far < self.config.max_requeue_attempts {
            metrics::counter!("consumer.requeued", "queue" => self.queue_name.clone())
                .increment(1);
            tracing::warn!(
                queue = %self.queue_name,
                correlation_id = %envelope.correlation_id,
                requeue = requeues_so_far + 1,
                max_requeue_attempts = self.config.max_requeue_attempts,
                error = %error,
                "Handler failed, requeueing"
            );
            sleep(self.config.requeue_delay).await;
            self.settle(delivery, Disposition::Requeue).await;
            return;
        }

        // Budget exhausted: durable diagnostics first, then settle without
        // requeue. If the sink write fails the delivery is dropped
        // unsettled so the broker re-delivers it later.
        let record = self.diagnostics(&delivery, envelope, error);

        if let Err(err) = self.dead_letters.record(record.clone()).await {
            tracing::error!(
                queue = %self.queue_name,
                correlation_id = %envelope.correlation_id,
                error = %err,
                "Failed to persist dead-letter record, leaving message unsettled"
            );
            return;
        }

        // Wire-visible counterpart of the record, best effort.
        let dl_queue = dead_letter_queue_name(&self.queue_name);
        let mut copy = delivery.message.clone();
        copy.props = copy
            .props
            .dead_lettered(&record.error_message, &self.queue_name);
        if let Err(err) = self.queue.publish(&dl_queue, copy).await {
            tracing::warn!(
                queue = %dl_queue,
                error = %err,
                "Failed to publish dead-letter copy"
            );
        }

        metrics::counter!("consumer.dead_lettered", "queue" => self.queue_name.clone())
            .increment(1);
        tracing::error!(
            queue = %self.queue_name,
            correlation_id = %envelope.correlation_id,
            event_id = %envelope.event_id,
            attempts = record.attempt_count,
            error = %record.error_message,
            "Message dead-lettered"
        );

        self.settle(delivery, Disposition::Reject).await;
    }

    fn diagnostics(
        &self,
        delivery: &Delivery,
        envelope: &EventEnvelope,
        error: &PipelineError<anyhow::Error>,
    ) -> DeadLetterRecord {
        let detail = match error {
            PipelineError::Exhausted { last_error, .. }
            | PipelineError::Interrupted { last_error, .. } => Some(format!("{last_error:?}")),
            PipelineError::Permanent(e) => Some(format!("{e:?}")),
            PipelineError::TimedOut { .. } => None,
        };

        DeadLetterRecord::new(
            delivery.queue.clone(),
            envelope.event_name.clone(),
            String::from_utf8_lossy(&delivery.message.payload).into_owned(),
            error.to_string(),
            detail,
            i32::try_from(delivery.message.props.retry_count).unwrap_or(i32::MAX),
            delivery.message.props.first_attempt,
            self.clock.now(),
        )
    }

    async fn settle(&self, delivery: Delivery, disposition: Disposition) {
        if let Err(err) = delivery.settle(disposition).await {
            tracing::warn!(
                queue = %self.queue_name,
                error = %err,
                "Failed to settle delivery"
            );
        }
    }
}
