//! In-memory queue implementations for deterministic tests.
//!
//! [`InMemoryQueue`] implements the full queue contract without a broker:
//! durable-until-settled messages, at most one unsettled delivery in flight
//! per subscriber, requeue with the retry counter bumped, and redelivery of
//! unsettled drops. Like the Kafka implementation's consumer groups, every
//! subscriber of a queue receives every message — that is what lets two
//! services each react to the same event type.
//!
//! [`FlakyQueue`] wraps any queue and fails the first N publishes with a
//! transient error, simulating a broker outage that later recovers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::queue::{
    Delivery, DeliveryStream, Disposition, MessageProps, MessageQueue, QueueError, QueueMessage,
    Receipt,
};
use tokio::sync::{Notify, oneshot};
use uuid::Uuid;

/// Build the wire message for an envelope, the way the relay does: the
/// broker message id reuses the envelope's `event_id`.
///
/// # Panics
///
/// Panics if the envelope cannot serialize, which cannot happen for a
/// well-formed [`EventEnvelope`].
#[must_use]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
pub fn envelope_message(envelope: &EventEnvelope, first_attempt: DateTime<Utc>) -> QueueMessage {
    QueueMessage {
        props: MessageProps::json(envelope.event_id, first_attempt),
        payload: envelope.to_bytes().unwrap(),
    }
}

/// A fresh message with random properties, for hand-crafted payloads.
#[must_use]
pub fn test_message(payload: &[u8]) -> QueueMessage {
    QueueMessage {
        props: MessageProps::json(Uuid::new_v4(), Utc::now()),
        payload: payload.to_vec(),
    }
}

#[derive(Default)]
struct QueueState {
    /// Append-only log of every message enqueued (publishes and requeues).
    log: Vec<QueueMessage>,
    /// One cursor per live subscriber; a subscriber has consumed
    /// `log[..cursor]`.
    cursors: Vec<Arc<AtomicUsize>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    /// Explicit publishes only (requeued copies excluded), per queue.
    /// Tests assert on this.
    history: HashMap<String, Vec<QueueMessage>>,
}

impl Inner {
    fn state(&mut self, queue: &str) -> &mut QueueState {
        self.queues.entry(queue.to_string()).or_default()
    }
}

/// Deterministic in-memory [`MessageQueue`].
///
/// Cloning shares the underlying queues, so producers and consumers in a
/// test see the same broker.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryQueue {
    /// Create an empty in-memory broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet consumed on a queue: the log length minus the
    /// furthest-behind subscriber (the whole log if nobody subscribed).
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn queue_depth(&self, queue: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(queue).map_or(0, |state| {
            let consumed = state
                .cursors
                .iter()
                .map(|c| c.load(Ordering::SeqCst))
                .min()
                .unwrap_or(0);
            state.log.len().saturating_sub(consumed)
        })
    }

    /// Every message explicitly published to a queue, in publish order.
    /// Requeued copies are not counted.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn published_history(&self, queue: &str) -> Vec<QueueMessage> {
        let inner = self.inner.lock().unwrap();
        inner.history.get(queue).cloned().unwrap_or_default()
    }

    /// Decode the envelopes ever published to a queue.
    #[must_use]
    pub fn published_envelopes(&self, queue: &str) -> Vec<EventEnvelope> {
        self.published_history(queue)
            .iter()
            .filter_map(|m| EventEnvelope::from_bytes(&m.payload).ok())
            .collect()
    }

    #[allow(clippy::unwrap_used)]
    fn enqueue(&self, queue: &str, message: QueueMessage, explicit_publish: bool) {
        let mut inner = self.inner.lock().unwrap();
        if explicit_publish {
            inner
                .history
                .entry(queue.to_string())
                .or_default()
                .push(message.clone());
        }
        let state = inner.state(queue);
        state.log.push(message);
        state.notify.notify_waiters();
    }
}

/// Performs the settlement bookkeeping synchronously, so queue state is
/// observable the moment `settle` returns; the oneshot only paces the
/// subscriber's generator (one unsettled delivery in flight).
struct InMemoryReceipt {
    queue: InMemoryQueue,
    queue_name: String,
    cursor: Arc<AtomicUsize>,
    message: QueueMessage,
    done_tx: oneshot::Sender<()>,
}

impl Receipt for InMemoryReceipt {
    fn settle(
        self: Box<Self>,
        disposition: Disposition,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        let this = *self;
        this.cursor.fetch_add(1, Ordering::SeqCst);
        if disposition == Disposition::Requeue {
            let requeued = QueueMessage {
                props: this.message.props.requeued(),
                payload: this.message.payload,
            };
            this.queue.enqueue(&this.queue_name, requeued, false);
        }
        let result = this
            .done_tx
            .send(())
            .map_err(|()| QueueError::SettleFailed("consumer loop is gone".into()));
        Box::pin(async move { result })
    }
}

impl MessageQueue for InMemoryQueue {
    fn publish(
        &self,
        queue: &str,
        message: QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        self.enqueue(queue, message, true);
        Box::pin(async { Ok(()) })
    }

    #[allow(clippy::unwrap_used)]
    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>> {
        let this = self.clone();
        let queue = queue.to_string();

        Box::pin(async move {
            // Register this subscriber: it reads the log from the start
            // (a durable queue delivers its backlog to a new consumer).
            let cursor = Arc::new(AtomicUsize::new(0));
            let notify = {
                let mut inner = this.inner.lock().unwrap();
                let state = inner.state(&queue);
                state.cursors.push(Arc::clone(&cursor));
                Arc::clone(&state.notify)
            };

            let stream = async_stream::stream! {
                loop {
                    // Arm the wakeup before checking the log so a publish
                    // between check and wait is never missed.
                    let message = loop {
                        let notified = notify.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();

                        let position = cursor.load(Ordering::SeqCst);
                        let next = {
                            let inner = this.inner.lock().unwrap();
                            inner
                                .queues
                                .get(&queue)
                                .and_then(|s| s.log.get(position).cloned())
                        };
                        match next {
                            Some(message) => break message,
                            None => notified.await,
                        }
                    };

                    let (done_tx, done_rx) = oneshot::channel();
                    yield Ok(Delivery::new(
                        queue.clone(),
                        message.clone(),
                        Box::new(InMemoryReceipt {
                            queue: this.clone(),
                            queue_name: queue.clone(),
                            cursor: Arc::clone(&cursor),
                            message,
                            done_tx,
                        }),
                    ));

                    // One unsettled delivery in flight: block until the
                    // consumer settles (or drops) it. A dropped receipt
                    // leaves the cursor where it was, so the same message
                    // is redelivered with its budget untouched.
                    let _ = done_rx.await;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Wrapper that fails the first `failures` publishes with a transient
/// error, then behaves like the wrapped queue. Consuming passes through.
pub struct FlakyQueue<Q> {
    inner: Arc<Q>,
    failures: usize,
    attempts: AtomicUsize,
}

impl<Q> FlakyQueue<Q> {
    /// Wrap `inner`, failing its first `failures` publishes.
    pub const fn new(inner: Arc<Q>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Publish attempts seen so far (including failed ones).
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<Q: MessageQueue> MessageQueue for FlakyQueue<Q> {
    fn publish(
        &self,
        queue: &str,
        message: QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Box::pin(async move {
                Err(QueueError::ConnectionFailed(
                    "simulated broker outage".into(),
                ))
            });
        }
        self.inner.publish(queue, message)
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>> {
        self.inner.consume(queue)
    }
}
