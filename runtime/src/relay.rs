//! Outbox relay: the polling loop that drains a service's outbox store.
//!
//! One relay runs per service instance. Every `poll_interval` it fetches up
//! to `batch_size` pending records and pushes each one through the publish
//! pipeline. A success marks the record published; a failure marks it
//! failed and moves on — one record's failure never blocks the batch.
//! Records that already spent their `max_retries` budget are left in place
//! and surfaced at warning level; they require manual intervention.
//!
//! On shutdown the relay makes one best-effort final pass, bounded by the
//! configured grace period. It does not guarantee the pass empties the
//! backlog — durability is the store's job, not the shutdown path's.
//!
//! # Scale-out
//!
//! The design assumes a single active relay per service. Running several
//! replicas without leader election or row-level claiming can double-send
//! (consumers must be idempotent anyway), but it cannot corrupt the store.

use crate::publisher::ResilientPublisher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::environment::Clock;
use steadfast_core::outbox::{OutboxRecord, OutboxStore};
use steadfast_core::queue::{MessageProps, MessageQueue, QueueMessage};
use tokio::sync::watch;
use tokio::time::sleep;

/// Externally supplied relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often to poll the outbox store.
    pub poll_interval: Duration,
    /// Maximum records fetched per poll.
    pub batch_size: usize,
    /// Publish attempts per record before it is left for an operator.
    pub max_retries: i32,
    /// Bound on the best-effort final drain during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 3,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Polling loop that drains an [`OutboxStore`] through a
/// [`ResilientPublisher`].
pub struct OutboxRelay<S, Q, C> {
    store: Arc<S>,
    publisher: ResilientPublisher<Q>,
    clock: C,
    config: RelayConfig,
    service: String,
}

impl<S, Q, C> OutboxRelay<S, Q, C>
where
    S: OutboxStore,
    Q: MessageQueue,
    C: Clock,
{
    /// Create a relay for one service's outbox.
    pub fn new(
        service: impl Into<String>,
        store: Arc<S>,
        publisher: ResilientPublisher<Q>,
        clock: C,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
            service: service.into(),
        }
    }

    /// Run the relay until `shutdown` flips true, then make one bounded
    /// best-effort final pass.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            service = %self.service,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Outbox relay started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.drain_once(&shutdown).await;
            self.surface_exhausted().await;

            tokio::select! {
                () = sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Final pass: best effort, bounded by the remaining grace period.
        if tokio::time::timeout(self.config.shutdown_grace, self.drain_once(&shutdown))
            .await
            .is_err()
        {
            tracing::warn!(
                service = %self.service,
                grace_ms = self.config.shutdown_grace.as_millis(),
                "Final outbox drain did not complete within the shutdown grace period"
            );
        }

        tracing::info!(service = %self.service, "Outbox relay stopped");
    }

    /// Fetch one batch and attempt every record in it.
    async fn drain_once(&self, shutdown: &watch::Receiver<bool>) {
        let records = match self
            .store
            .fetch_pending(self.config.batch_size, self.config.max_retries)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(
                    service = %self.service,
                    error = %err,
                    "Failed to fetch pending outbox records"
                );
                return;
            }
        };

        if records.is_empty() {
            return;
        }

        tracing::debug!(
            service = %self.service,
            count = records.len(),
            "Draining outbox batch"
        );

        for record in records {
            self.attempt(record, shutdown).await;
        }

        if let Ok(pending) = self.store.count_pending(self.config.max_retries).await {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!("outbox.pending", "service" => self.service.clone())
                .set(pending as f64);
        }
    }

    /// Push one record through the publish pipeline and record the outcome.
    async fn attempt(&self, record: OutboxRecord, shutdown: &watch::Receiver<bool>) {
        let (destination, message, correlation_id) =
            match Self::message_for(&record, self.clock.now()) {
                Ok(parts) => parts,
                Err(reason) => {
                    // A corrupt payload can never publish; count the attempt
                    // so the record eventually surfaces as exhausted.
                    tracing::warn!(
                        service = %self.service,
                        outbox_id = %record.id,
                        error = %reason,
                        "Outbox payload is not a valid envelope"
                    );
                    self.mark_failed(record.id, &reason).await;
                    return;
                }
            };

        match self.publisher.send_until(&destination, message, shutdown).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_published(record.id).await {
                    tracing::error!(
                        service = %self.service,
                        outbox_id = %record.id,
                        error = %err,
                        "Published but failed to mark record (will re-send later; consumers dedup)"
                    );
                    return;
                }
                metrics::counter!("outbox.published", "service" => self.service.clone())
                    .increment(1);
                tracing::info!(
                    service = %self.service,
                    outbox_id = %record.id,
                    correlation_id = %correlation_id,
                    event_type = %record.event_type,
                    "Outbox record published"
                );
            }
            Err(err) => {
                metrics::counter!("outbox.publish_failed", "service" => self.service.clone())
                    .increment(1);
                tracing::warn!(
                    service = %self.service,
                    outbox_id = %record.id,
                    correlation_id = %correlation_id,
                    retry_count = record.retry_count,
                    error = %err,
                    "Outbox record failed to publish, will retry on a later poll"
                );
                self.mark_failed(record.id, &err.to_string()).await;
            }
        }
    }

    /// Build the wire message for a record. The destination queue is the
    /// record's event type; the broker message id reuses the envelope's
    /// `event_id` so consumers can dedup on it.
    fn message_for(
        record: &OutboxRecord,
        now: DateTime<Utc>,
    ) -> Result<(String, QueueMessage, uuid::Uuid), String> {
        let envelope =
            EventEnvelope::from_bytes(record.payload.as_bytes()).map_err(|e| e.to_string())?;

        let message = QueueMessage {
            props: MessageProps::json(envelope.event_id, now),
            payload: record.payload.clone().into_bytes(),
        };

        Ok((record.event_type.clone(), message, envelope.correlation_id))
    }

    async fn mark_failed(&self, id: uuid::Uuid, error: &str) {
        if let Err(err) = self.store.mark_failed(id, error).await {
            tracing::error!(
                service = %self.service,
                outbox_id = %id,
                error = %err,
                "Failed to mark outbox record failed"
            );
        }
    }

    /// Surface records stuck past the retry budget. They are skipped by
    /// `fetch_pending` and never deleted; an operator has to step in.
    async fn surface_exhausted(&self) {
        match self.store.count_exhausted(self.config.max_retries).await {
            Ok(0) => {}
            Ok(stuck) => {
                #[allow(clippy::cast_precision_loss)]
                metrics::gauge!("outbox.exhausted", "service" => self.service.clone())
                    .set(stuck as f64);
                tracing::warn!(
                    service = %self.service,
                    stuck,
                    max_retries = self.config.max_retries,
                    "Outbox records past the retry budget require manual intervention"
                );
            }
            Err(err) => {
                tracing::error!(
                    service = %self.service,
                    error = %err,
                    "Failed to count exhausted outbox records"
                );
            }
        }
    }
}
