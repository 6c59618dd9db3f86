//! Resilient publish pipeline: one broker send, bounded retries.
//!
//! Wraps a single [`MessageQueue::publish`] call in the
//! [`RetryPolicy::publish`] pipeline. On exhaustion the terminal failure is
//! surfaced to the caller:
//!
//! - the outbox relay marks the record failed and moves on — the record
//!   stays durable and will be retried on a later poll;
//! - a direct (non-outbox) caller should log and proceed, because
//!   durability was already guaranteed when the outbox record was appended,
//!   not by this call succeeding synchronously.
//!
//! The pipeline is synchronous from the caller's point of view and spawns
//! no detached work.

use crate::retry::{PipelineError, RetryPolicy, retry_with_backoff, retry_with_backoff_until};
use std::sync::Arc;
use steadfast_core::queue::{MessageQueue, QueueError, QueueMessage};
use tokio::sync::watch;

/// Bounded-retry wrapper around a queue's publish operation.
pub struct ResilientPublisher<Q> {
    queue: Arc<Q>,
    policy: RetryPolicy,
}

impl<Q: MessageQueue> ResilientPublisher<Q> {
    /// Wrap a queue with the default publish policy.
    pub fn new(queue: Arc<Q>) -> Self {
        Self::with_policy(queue, RetryPolicy::publish())
    }

    /// Wrap a queue with an explicit policy.
    pub const fn with_policy(queue: Arc<Q>, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    /// The underlying queue (for consumers and direct publishes that manage
    /// their own retries).
    #[must_use]
    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    /// Send one message to one destination under the retry budget.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's terminal failure ([`PipelineError::Exhausted`]
    /// or [`PipelineError::TimedOut`]) once the budget is spent.
    pub async fn send(
        &self,
        destination: &str,
        message: QueueMessage,
    ) -> Result<(), PipelineError<QueueError>> {
        let outcome = retry_with_backoff(&self.policy, || {
            self.queue.publish(destination, message.clone())
        })
        .await;

        self.report(destination, &message, outcome)
    }

    /// Like [`send`](Self::send), but stops scheduling retries once
    /// `shutdown` flips true. An attempt already in flight finishes.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`PipelineError::Interrupted`] when
    /// shutdown preempts the remaining budget.
    pub async fn send_until(
        &self,
        destination: &str,
        message: QueueMessage,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), PipelineError<QueueError>> {
        let outcome = retry_with_backoff_until(&self.policy, shutdown, || {
            self.queue.publish(destination, message.clone())
        })
        .await;

        self.report(destination, &message, outcome)
    }

    fn report(
        &self,
        destination: &str,
        message: &QueueMessage,
        outcome: Result<(), PipelineError<QueueError>>,
    ) -> Result<(), PipelineError<QueueError>> {
        let message_id = message.props.message_id;

        match &outcome {
            Ok(()) => {
                metrics::counter!("delivery.publish.confirmed").increment(1);
                tracing::debug!(
                    destination = destination,
                    message_id = %message_id,
                    "Message published"
                );
            }
            Err(err) => {
                metrics::counter!("delivery.publish.exhausted").increment(1);
                tracing::error!(
                    destination = destination,
                    message_id = %message_id,
                    error = %err,
                    "Publish pipeline exhausted"
                );
            }
        }

        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use steadfast_core::queue::{DeliveryStream, MessageProps};
    use uuid::Uuid;

    /// Queue stub that fails the first `failures` publishes.
    struct FlakySink {
        attempts: AtomicUsize,
        failures: usize,
    }

    impl MessageQueue for FlakySink {
        fn publish(
            &self,
            queue: &str,
            _message: QueueMessage,
        ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = n < self.failures;
            let queue = queue.to_string();
            Box::pin(async move {
                if fail {
                    Err(QueueError::TransportError(format!("send to {queue} reset")))
                } else {
                    Ok(())
                }
            })
        }

        fn consume(
            &self,
            queue: &str,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>>
        {
            let queue = queue.to_string();
            Box::pin(async move {
                Err(QueueError::ConsumeFailed {
                    queue,
                    reason: "sink only".into(),
                })
            })
        }
    }

    fn message() -> QueueMessage {
        QueueMessage {
            props: MessageProps::json(Uuid::new_v4(), Utc::now()),
            payload: b"{}".to_vec(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::publish()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn retries_through_transient_failures() {
        let sink = Arc::new(FlakySink {
            attempts: AtomicUsize::new(0),
            failures: 2,
        });
        let publisher = ResilientPublisher::with_policy(Arc::clone(&sink), fast_policy(5));

        publisher.send("booking.requested", message()).await.unwrap();
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_terminal_failure_after_budget() {
        let sink = Arc::new(FlakySink {
            attempts: AtomicUsize::new(0),
            failures: usize::MAX,
        });
        let publisher = ResilientPublisher::with_policy(Arc::clone(&sink), fast_policy(3));

        let result = publisher.send("booking.requested", message()).await;

        assert!(matches!(result, Err(PipelineError::Exhausted { attempts: 3, .. })));
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    }
}
