//! Dead-letter sink: durable records of terminally failed messages.
//!
//! A record lands here only when a consumer exhausts its bounded requeue
//! budget for a message. Records are never auto-deleted and `resolved` is
//! flipped only by manual/administrative action, so failures stay queryable
//! until an operator deals with them.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from dead-letter store operations.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    /// The underlying store failed.
    #[error("Dead-letter storage error: {0}")]
    StorageError(String),

    /// No record exists with the given id.
    #[error("Dead-letter record not found: {0}")]
    NotFound(Uuid),
}

/// Diagnostic record for one terminally failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Unique record identifier.
    pub id: Uuid,
    /// Queue the message was being consumed from.
    pub source_queue: String,
    /// Event discriminator of the failed message.
    pub event_type: String,
    /// The original message payload, untouched.
    pub payload: String,
    /// The error that exhausted the budget.
    pub error_message: String,
    /// Optional captured backtrace/debug detail.
    pub stack_trace: Option<String>,
    /// Total requeue attempts consumed (equals the configured bound).
    pub attempt_count: i32,
    /// When the message was first attempted.
    pub first_attempt_at: DateTime<Utc>,
    /// When the message was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// Manual-recovery flag; false until an operator resolves the record.
    pub resolved: bool,
}

impl DeadLetterRecord {
    /// Build a record for a message that just exhausted its budget.
    ///
    /// `id` is minted fresh; `resolved` starts false.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_queue: String,
        event_type: String,
        payload: String,
        error_message: String,
        stack_trace: Option<String>,
        attempt_count: i32,
        first_attempt_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_queue,
            event_type,
            payload,
            error_message,
            stack_trace,
            attempt_count,
            first_attempt_at,
            failed_at,
            resolved: false,
        }
    }
}

/// Durable sink for dead-letter records.
pub trait DeadLetterStore: Send + Sync {
    /// Persist a record. Called exactly once per exhausted message.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageError`] if the store is
    /// unreachable.
    fn record(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// List unresolved records, oldest failure first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageError`] if the store is
    /// unreachable.
    fn list_unresolved(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>, DeadLetterError>> + Send + '_>>;

    /// Administrative action: mark a record resolved after manual recovery.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if no such record exists.
    fn mark_resolved(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// Number of unresolved records (health-check surface).
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageError`] if the store is
    /// unreachable.
    fn count_unresolved(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_unresolved() {
        let now = Utc::now();
        let record = DeadLetterRecord::new(
            "booking.requested".into(),
            "booking.requested".into(),
            "{}".into(),
            "handler failed".into(),
            None,
            3,
            now,
            now,
        );

        assert!(!record.resolved);
        assert_eq!(record.attempt_count, 3);
        assert_ne!(record.id, Uuid::nil());
    }
}
