//! Kafka-protocol queue implementation for the Steadfast delivery layer.
//!
//! Implements the [`MessageQueue`] abstraction from `steadfast-core` over
//! rdkafka, so it works against Redpanda, Apache Kafka, or any other
//! Kafka-compatible broker.
//!
//! # Mapping queue semantics onto Kafka
//!
//! The delivery layer speaks in durable queues with per-message settlement;
//! Kafka speaks in topics and offsets. The mapping:
//!
//! | queue concept            | Kafka expression                               |
//! |--------------------------|------------------------------------------------|
//! | durable queue            | topic (all messages of a queue share one key,  |
//! |                          | so they land on one partition, in order)       |
//! | ack                      | commit the message's offset                    |
//! | requeue                  | re-publish with the retry-count header bumped, |
//! |                          | then commit the original                       |
//! | reject                   | commit without re-publishing                   |
//! | message properties       | Kafka message headers                          |
//!
//! # Delivery semantics
//!
//! **At-least-once** with manual commits: an offset is committed only after
//! the consumer settles the delivery. A crash before settlement redelivers
//! the message, so handlers must be idempotent. Exactly one unsettled
//! delivery is in flight per consumed queue, which yields strict per-queue
//! ordering.
//!
//! Publishing requests broker acknowledgment from all in-sync replicas
//! (`acks=all` by default): a resolved publish means the broker has the
//! message, and only then does a relay mark the outbox record published.
//!
//! The producer is established lazily through the patient connection
//! pipeline and re-established whenever a publish fails with a transient
//! error.
//!
//! # Example
//!
//! ```no_run
//! use steadfast_redpanda::RedpandaQueue;
//! use steadfast_core::queue::MessageQueue;
//!
//! # async fn example(message: steadfast_core::queue::QueueMessage) -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaQueue::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("payment-service")
//!     .build()?;
//!
//! queue.publish("booking.requested", message).await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::queue::{
    Delivery, DeliveryStream, Disposition, MessageProps, MessageQueue, QueueError, QueueMessage,
    Receipt,
};
use steadfast_runtime::connection::{ConnectionManager, Connector};
use steadfast_runtime::retry::RetryPolicy;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const HEADER_MESSAGE_ID: &str = "message-id";
const HEADER_CONTENT_TYPE: &str = "content-type";
const HEADER_RETRY_COUNT: &str = "retry-count";
const HEADER_FIRST_ATTEMPT: &str = "first-attempt";
const HEADER_ERROR_MESSAGE: &str = "error-message";
const HEADER_ORIGINAL_QUEUE: &str = "original-queue";

/// Classify an rdkafka error into the transient/permanent taxonomy.
fn classify(error: &rdkafka::error::KafkaError, queue: &str) -> QueueError {
    use rdkafka::types::RDKafkaErrorCode;

    let code = error.rdkafka_error_code();
    match code {
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::NotCoordinator,
        ) => QueueError::ConnectionFailed(error.to_string()),
        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => QueueError::Timeout(error.to_string()),
        _ => QueueError::PublishFailed {
            queue: queue.to_string(),
            reason: error.to_string(),
        },
    }
}

/// Encode message properties as Kafka headers.
fn headers_for(props: &MessageProps) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: HEADER_MESSAGE_ID,
            value: Some(props.message_id.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_CONTENT_TYPE,
            value: Some(props.content_type.as_bytes()),
        })
        .insert(Header {
            key: HEADER_RETRY_COUNT,
            value: Some(props.retry_count.to_string().as_bytes()),
        })
        .insert(Header {
            key: HEADER_FIRST_ATTEMPT,
            value: Some(props.first_attempt.to_rfc3339().as_bytes()),
        });

    if let Some(error_message) = &props.error_message {
        headers = headers.insert(Header {
            key: HEADER_ERROR_MESSAGE,
            value: Some(error_message.as_bytes()),
        });
    }
    if let Some(original_queue) = &props.original_queue {
        headers = headers.insert(Header {
            key: HEADER_ORIGINAL_QUEUE,
            value: Some(original_queue.as_bytes()),
        });
    }

    headers
}

/// Decode message properties from Kafka headers.
///
/// Messages produced outside this layer may lack headers; such messages get
/// fresh defaults (zero retries, first attempt = now) so the consumer's
/// bookkeeping still works.
fn props_from<H: Headers>(headers: Option<&H>, now: DateTime<Utc>) -> MessageProps {
    let mut props = MessageProps::json(Uuid::new_v4(), now);

    let Some(headers) = headers else {
        return props;
    };

    for header in headers.iter() {
        let Some(value) = header.value else { continue };
        let Ok(text) = std::str::from_utf8(value) else {
            continue;
        };
        match header.key {
            HEADER_MESSAGE_ID => {
                if let Ok(id) = Uuid::parse_str(text) {
                    props.message_id = id;
                }
            }
            HEADER_CONTENT_TYPE => props.content_type = text.to_string(),
            HEADER_RETRY_COUNT => {
                if let Ok(count) = text.parse() {
                    props.retry_count = count;
                }
            }
            HEADER_FIRST_ATTEMPT => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
                    props.first_attempt = ts.with_timezone(&Utc);
                }
            }
            HEADER_ERROR_MESSAGE => props.error_message = Some(text.to_string()),
            HEADER_ORIGINAL_QUEUE => props.original_queue = Some(text.to_string()),
            _ => {}
        }
    }

    props
}

/// Producer factory run under the connection pipeline.
///
/// Creating an rdkafka producer succeeds even with the broker down, so the
/// connector also fetches cluster metadata to prove reachability — that is
/// what the patient retry loop actually waits on.
struct ProducerConnector {
    brokers: String,
    acks: String,
    compression: String,
    timeout: Duration,
}

impl Connector for ProducerConnector {
    type Connection = FutureProducer;

    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Connection, QueueError>> + Send + '_>> {
        Box::pin(async move {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("acks", &self.acks)
                .set("compression.type", &self.compression)
                .set("message.timeout.ms", self.timeout.as_millis().to_string())
                .create()
                .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

            // Prove the cluster is reachable before handing the producer out.
            let probe = producer.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || {
                probe
                    .client()
                    .fetch_metadata(None, timeout)
                    .map(|_| ())
                    .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
            })
            .await
            .map_err(|e| QueueError::ConnectionFailed(format!("metadata probe panicked: {e}")))??;

            Ok(producer)
        })
    }

    fn is_healthy(&self, _connection: &Self::Connection) -> bool {
        // librdkafka reconnects internally; staleness is detected by a
        // failed publish, which invalidates the cached producer.
        true
    }
}

/// Kafka-protocol [`MessageQueue`].
pub struct RedpandaQueue {
    brokers: String,
    producer: Arc<ConnectionManager<ProducerConnector>>,
    timeout: Duration,
    consumer_group: Option<String>,
    auto_offset_reset: String,
}

impl RedpandaQueue {
    /// Create a queue with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the broker list is
    /// invalid.
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for configuring the queue.
    #[must_use]
    pub fn builder() -> RedpandaQueueBuilder {
        RedpandaQueueBuilder::default()
    }

    /// The configured broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaQueue`].
#[derive(Default)]
pub struct RedpandaQueueBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    connect_policy: Option<RetryPolicy>,
}

impl RedpandaQueueBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// Default: `"all"` — a publish resolves only once every in-sync
    /// replica has the message. Lowering this re-opens the narrow
    /// at-least-once gap between "send returned" and "broker has it".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec (`"none"`, `"gzip"`, `"snappy"`, `"lz4"`,
    /// `"zstd"`). Default: `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the per-send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group id. If unset, a group is derived from the
    /// queue name, giving every service instance of one deployment a shared
    /// workload.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a new consumer group starts reading. Default: `"earliest"` —
    /// a queue is durable, so a newly attached consumer drains the backlog
    /// instead of skipping it.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Override the connection pipeline policy.
    #[must_use]
    pub fn connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = Some(policy);
        self
    }

    /// Build the [`RedpandaQueue`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if brokers are not set. The
    /// first actual connection happens lazily, on first use.
    pub fn build(self) -> Result<RedpandaQueue, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::ConnectionFailed("Brokers not configured".to_string()))?;

        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let connector = ProducerConnector {
            brokers: brokers.clone(),
            acks: self.producer_acks.unwrap_or_else(|| "all".to_string()),
            compression: self.compression.unwrap_or_else(|| "none".to_string()),
            timeout,
        };
        let connect_policy = self.connect_policy.unwrap_or_else(RetryPolicy::connect);

        tracing::info!(
            brokers = %brokers,
            acks = %connector.acks,
            compression = %connector.compression,
            "RedpandaQueue configured"
        );

        Ok(RedpandaQueue {
            brokers,
            producer: Arc::new(ConnectionManager::with_policy(connector, connect_policy)),
            timeout,
            consumer_group: self.consumer_group,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
        })
    }
}

struct KafkaReceipt {
    settle_tx: oneshot::Sender<Disposition>,
}

impl Receipt for KafkaReceipt {
    fn settle(
        self: Box<Self>,
        disposition: Disposition,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        let result = self
            .settle_tx
            .send(disposition)
            .map_err(|_| QueueError::SettleFailed("consumer task is gone".into()));
        Box::pin(async move { result })
    }
}

impl MessageQueue for RedpandaQueue {
    fn publish(
        &self,
        queue: &str,
        message: QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let timeout = self.timeout;
        let manager = Arc::clone(&self.producer);

        Box::pin(async move {
            // Lazily (re-)established through the connection pipeline.
            let producer = manager.get().await.map_err(|e| match e.into_inner() {
                Some(inner) => inner,
                None => QueueError::ConnectionFailed("connection pipeline timed out".into()),
            })?;

            let headers = headers_for(&message.props);
            // All messages of one queue share the queue name as key, so
            // they serialize onto one partition: strict per-queue order.
            let record = FutureRecord::to(&queue)
                .payload(&message.payload)
                .key(queue.as_bytes())
                .headers(headers);

            match producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        queue = %queue,
                        partition,
                        offset,
                        message_id = %message.props.message_id,
                        "Message published and broker-acknowledged"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    let error = classify(&kafka_error, &queue);
                    if error.is_transient() {
                        manager.invalidate().await;
                    }
                    tracing::warn!(
                        queue = %queue,
                        error = %error,
                        "Failed to publish message"
                    );
                    Err(error)
                }
            }
        })
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let brokers = self.brokers.clone();
        let group = self
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("steadfast-{queue}"));
        let auto_offset_reset = self.auto_offset_reset.clone();
        let manager = Arc::clone(&self.producer);
        let timeout = self.timeout;

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group)
                .set("enable.auto.commit", "false") // manual commit: at-least-once
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| QueueError::ConsumeFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[queue.as_str()])
                .map_err(|e| QueueError::ConsumeFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                queue = %queue,
                consumer_group = %group,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Consuming queue"
            );

            // Capacity 1: at most one unsettled delivery in flight.
            let (tx, rx) = mpsc::channel::<Result<Delivery, QueueError>>(1);

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(next) = stream.next().await {
                    let borrowed = match next {
                        Ok(message) => message,
                        Err(e) => {
                            let error = QueueError::TransportError(e.to_string());
                            if tx.send(Err(error)).await.is_err() {
                                break; // receiver dropped
                            }
                            continue;
                        }
                    };

                    let payload = borrowed.payload().unwrap_or_default().to_vec();
                    let props = props_from(borrowed.headers(), Utc::now());
                    let message = QueueMessage {
                        props,
                        payload,
                    };

                    let (settle_tx, settle_rx) = oneshot::channel();
                    let delivery = Delivery::new(
                        queue.clone(),
                        message.clone(),
                        Box::new(KafkaReceipt { settle_tx }),
                    );

                    if tx.send(Ok(delivery)).await.is_err() {
                        // Receiver dropped: exit WITHOUT committing so the
                        // message is redelivered.
                        break;
                    }

                    // Block until the consumer settles: the one-in-flight
                    // bound and the ordering guarantee both live here.
                    match settle_rx.await {
                        Ok(Disposition::Ack | Disposition::Reject) => {
                            if let Err(e) = consumer.commit_message(&borrowed, CommitMode::Async)
                            {
                                tracing::warn!(
                                    queue = %queue,
                                    offset = borrowed.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        }
                        Ok(Disposition::Requeue) => {
                            // Re-publish with the counter bumped, and only
                            // commit the original once the copy is durable.
                            let requeued = QueueMessage {
                                props: message.props.requeued(),
                                payload: message.payload.clone(),
                            };
                            let headers = headers_for(&requeued.props);
                            let produced = match manager.get().await {
                                Ok(producer) => {
                                    let record = FutureRecord::to(&queue)
                                        .payload(&requeued.payload)
                                        .key(queue.as_bytes())
                                        .headers(headers);
                                    producer
                                        .send(record, Timeout::After(timeout))
                                        .await
                                        .map(|_| ())
                                        .map_err(|(e, _)| classify(&e, &queue))
                                }
                                Err(e) => Err(QueueError::ConnectionFailed(e.to_string())),
                            };

                            match produced {
                                Ok(()) => {
                                    if let Err(e) =
                                        consumer.commit_message(&borrowed, CommitMode::Async)
                                    {
                                        tracing::warn!(
                                            queue = %queue,
                                            error = %e,
                                            "Requeued but failed to commit original (duplicate possible)"
                                        );
                                    }
                                }
                                Err(e) => {
                                    // Leave uncommitted: the original will
                                    // be redelivered without a counter bump,
                                    // which is the safe direction.
                                    tracing::warn!(
                                        queue = %queue,
                                        error = %e,
                                        "Failed to requeue, leaving offset uncommitted"
                                    );
                                }
                            }
                        }
                        Err(_) => {
                            // Delivery dropped unsettled; do not commit.
                            tracing::debug!(
                                queue = %queue,
                                "Delivery dropped without settlement, offset left uncommitted"
                            );
                        }
                    }
                }

                tracing::debug!(queue = %queue, "Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_queue_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaQueue>();
        assert_sync::<RedpandaQueue>();
    }

    #[test]
    fn builder_requires_brokers() {
        assert!(RedpandaQueue::builder().build().is_err());
        assert!(RedpandaQueue::builder().brokers("localhost:9092").build().is_ok());
    }

    #[test]
    fn header_codec_roundtrip() {
        let mut props = MessageProps::json(Uuid::new_v4(), Utc::now());
        props.retry_count = 4;
        props = props.dead_lettered("handler exploded", "booking.requested");

        let headers = headers_for(&props);
        let decoded = props_from(Some(&headers), Utc::now());

        assert_eq!(decoded.message_id, props.message_id);
        assert_eq!(decoded.content_type, props.content_type);
        assert_eq!(decoded.retry_count, 4);
        assert_eq!(
            decoded.first_attempt.timestamp_millis(),
            props.first_attempt.timestamp_millis()
        );
        assert_eq!(decoded.error_message.as_deref(), Some("handler exploded"));
        assert_eq!(
            decoded.original_queue.as_deref(),
            Some("booking.requested")
        );
    }

    #[test]
    fn missing_headers_get_fresh_defaults() {
        let now = Utc::now();
        let props = props_from::<OwnedHeaders>(None, now);
        assert_eq!(props.retry_count, 0);
        assert_eq!(props.first_attempt, now);
        assert!(props.error_message.is_none());
    }

    #[test]
    fn transient_kafka_errors_classify_as_retryable() {
        use rdkafka::error::KafkaError;
        use rdkafka::types::RDKafkaErrorCode;

        let transport = KafkaError::MessageProduction(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(classify(&transport, "q").is_transient());

        let timed_out = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(classify(&timed_out, "q").is_transient());

        let too_large = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(!classify(&too_large, "q").is_transient());
    }
}
