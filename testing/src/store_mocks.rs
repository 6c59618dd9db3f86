//! In-memory outbox and dead-letter stores.
//!
//! Both stores arbitrate through a single `Mutex`, which is the in-memory
//! stand-in for the durable store's transactional guarantees: a service's
//! business mutation and its outbox append happen under one lock, so a
//! failed business operation appends nothing.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use steadfast_core::dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterStore};
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::outbox::{OutboxError, OutboxRecord, OutboxStore, truncate_error};
use uuid::Uuid;

/// In-memory [`OutboxStore`].
///
/// Cloning shares the underlying records.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    records: Arc<Mutex<Vec<OutboxRecord>>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope as a pending record.
    ///
    /// Callers hold their service lock across the business mutation and
    /// this append, which is the in-memory unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::StorageError`] if the envelope cannot
    /// serialize.
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn append(&self, envelope: &EventEnvelope) -> Result<OutboxRecord, OutboxError> {
        let payload = envelope
            .to_bytes()
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;
        let payload =
            String::from_utf8(payload).map_err(|e| OutboxError::StorageError(e.to_string()))?;

        let record = OutboxRecord {
            id: Uuid::new_v4(),
            event_type: envelope.event_name.clone(),
            payload,
            created_at: Utc::now(),
            published: false,
            published_at: None,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
        };

        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    /// Snapshot of every record, in append order.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn all_records(&self) -> Vec<OutboxRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Look up one record.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn record(&self, id: Uuid) -> Option<OutboxRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    #[allow(clippy::unwrap_used)]
    fn fetch_pending(
        &self,
        batch_size: usize,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        let mut pending: Vec<OutboxRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.published && r.retry_count < max_retries)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(batch_size);
        Box::pin(async move { Ok(pending) })
    }

    #[allow(clippy::unwrap_used)]
    fn mark_published(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            // Repeat calls are no-ops.
            if !record.published {
                record.published = true;
                record.published_at = Some(Utc::now());
            }
        }
        drop(records);
        Box::pin(async { Ok(()) })
    }

    #[allow(clippy::unwrap_used)]
    fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.id == id && !r.published) {
            record.retry_count += 1;
            record.last_error = Some(truncate_error(error));
            record.last_attempt_at = Some(Utc::now());
        }
        drop(records);
        Box::pin(async { Ok(()) })
    }

    #[allow(clippy::unwrap_used)]
    fn count_pending(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        let count = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.published && r.retry_count < max_retries)
            .count() as u64;
        Box::pin(async move { Ok(count) })
    }

    #[allow(clippy::unwrap_used)]
    fn count_exhausted(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        let count = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.published && r.retry_count >= max_retries)
            .count() as u64;
        Box::pin(async move { Ok(count) })
    }
}

/// In-memory [`DeadLetterStore`].
///
/// Cloning shares the underlying records.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in arrival order.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
    pub fn all_records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    #[allow(clippy::unwrap_used)]
    fn record(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        self.records.lock().unwrap().push(record);
        Box::pin(async { Ok(()) })
    }

    #[allow(clippy::unwrap_used)]
    fn list_unresolved(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>, DeadLetterError>> + Send + '_>>
    {
        let mut unresolved: Vec<DeadLetterRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.resolved)
            .cloned()
            .collect();
        unresolved.sort_by_key(|r| r.failed_at);
        unresolved.truncate(limit);
        Box::pin(async move { Ok(unresolved) })
    }

    #[allow(clippy::unwrap_used)]
    fn mark_resolved(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let mut records = self.records.lock().unwrap();
        let result = match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.resolved = true;
                Ok(())
            }
            None => Err(DeadLetterError::NotFound(id)),
        };
        drop(records);
        Box::pin(async move { result })
    }

    #[allow(clippy::unwrap_used)]
    fn count_unresolved(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>> {
        let count = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.resolved)
            .count() as u64;
        Box::pin(async move { Ok(count) })
    }
}
