//! Outbox store: the per-service durable log of to-be-published events.
//!
//! The outbox pattern exists to avoid the dual-write problem: "write DB,
//! then call broker" loses the event if the second step fails. Instead, the
//! event record is written in the *same* unit of work as the business
//! mutation, and a relay publishes it afterwards. The record therefore
//! exists **iff** the mutation committed.
//!
//! Appending is store-specific because it must join the owning service's
//! transaction (`PgOutboxStore::append` takes a `sqlx` transaction; the
//! in-memory store appends under the same lock as the service state). The
//! relay-facing operations below are what every store has in common.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from outbox store operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The underlying store failed.
    #[error("Outbox storage error: {0}")]
    StorageError(String),

    /// No record exists with the given id.
    #[error("Outbox record not found: {0}")]
    NotFound(Uuid),
}

/// One durable to-be-published event.
///
/// A record with `published == false` means "not yet confirmed delivered",
/// never "the mutation didn't happen". Records whose `retry_count` reached
/// the configured cap are left in place for operator inspection; nothing in
/// this layer deletes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Unique record identifier.
    pub id: Uuid,
    /// Event discriminator; also the destination queue name.
    pub event_type: String,
    /// Serialized [`EventEnvelope`] JSON.
    ///
    /// [`EventEnvelope`]: crate::envelope::EventEnvelope
    pub payload: String,
    /// When the record was appended (commit time of the business mutation).
    pub created_at: DateTime<Utc>,
    /// Whether the broker has confirmed delivery.
    pub published: bool,
    /// When delivery was confirmed.
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub retry_count: i32,
    /// Most recent publish error, truncated.
    pub last_error: Option<String>,
    /// When the most recent publish attempt happened.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Maximum stored length of `last_error`; longer messages are truncated.
pub const MAX_STORED_ERROR_LEN: usize = 512;

/// Truncate an error message to [`MAX_STORED_ERROR_LEN`] for storage.
#[must_use]
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_STORED_ERROR_LEN {
        error.to_string()
    } else {
        let mut end = MAX_STORED_ERROR_LEN;
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        error[..end].to_string()
    }
}

/// Relay-facing operations common to every outbox store.
///
/// `mark_published` and `mark_failed` are safe to repeat for the same id:
/// marking a published record published again is a no-op, and a failure mark
/// never resurrects a record that was already confirmed published.
pub trait OutboxStore: Send + Sync {
    /// Fetch unpublished records with `retry_count < max_retries`, oldest
    /// first (FIFO preserves per-service emission order), at most
    /// `batch_size` of them.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::StorageError`] if the store is unreachable.
    fn fetch_pending(
        &self,
        batch_size: usize,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>>;

    /// Record a confirmed delivery.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::StorageError`] if the store is unreachable.
    fn mark_published(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Record a failed publish attempt: increments `retry_count`, stores the
    /// (truncated) error and stamps `last_attempt_at`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::StorageError`] if the store is unreachable.
    fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Number of unpublished records still under the retry cap.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::StorageError`] if the store is unreachable.
    fn count_pending(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>>;

    /// Number of unpublished records stuck at or past the retry cap. These
    /// require manual intervention; the relay surfaces them at warning
    /// level and otherwise leaves them alone.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::StorageError`] if the store is unreachable.
    fn count_exhausted(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>>;
}
