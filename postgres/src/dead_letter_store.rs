//! `PostgreSQL` dead-letter sink.
//!
//! Terminally failed messages land here with their accumulated diagnostics
//! and stay queryable until an operator resolves them. Nothing in this
//! layer deletes a row; `resolved` is the only state an administrative
//! action flips.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE dead_letters (
//!     id               UUID PRIMARY KEY,
//!     source_queue     TEXT NOT NULL,
//!     event_type       TEXT NOT NULL,
//!     payload          TEXT NOT NULL,
//!     error_message    TEXT NOT NULL,
//!     stack_trace      TEXT,
//!     attempt_count    INTEGER NOT NULL,
//!     first_attempt_at TIMESTAMPTZ NOT NULL,
//!     failed_at        TIMESTAMPTZ NOT NULL,
//!     resolved         BOOLEAN NOT NULL DEFAULT FALSE
//! );
//!
//! CREATE INDEX idx_dead_letters_unresolved
//!     ON dead_letters (failed_at)
//!     WHERE resolved = FALSE;
//! ```

use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use steadfast_core::dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterStore};
use uuid::Uuid;

/// `PostgreSQL`-backed [`DeadLetterStore`].
///
/// Provides persistent storage for messages that exhausted their requeue
/// budget, enabling:
/// - incident investigation and debugging
/// - manual reprocessing workflows
/// - failure trend analysis
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    /// Create a sink over the service's connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> DeadLetterRecord {
        DeadLetterRecord {
            id: row.get("id"),
            source_queue: row.get("source_queue"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            error_message: row.get("error_message"),
            stack_trace: row.get("stack_trace"),
            attempt_count: row.get("attempt_count"),
            first_attempt_at: row.get("first_attempt_at"),
            failed_at: row.get("failed_at"),
            resolved: row.get("resolved"),
        }
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if no record has this id.
    pub async fn get_by_id(&self, id: Uuid) -> Result<DeadLetterRecord, DeadLetterError> {
        let row = sqlx::query(
            r"
            SELECT id, source_queue, event_type, payload, error_message,
                   stack_trace, attempt_count, first_attempt_at, failed_at,
                   resolved
            FROM dead_letters
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DeadLetterError::StorageError(e.to_string()))?;

        row.map(|r| Self::row_to_record(&r))
            .ok_or(DeadLetterError::NotFound(id))
    }
}

impl DeadLetterStore for PgDeadLetterStore {
    fn record(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO dead_letters (
                    id, source_queue, event_type, payload, error_message,
                    stack_trace, attempt_count, first_attempt_at, failed_at,
                    resolved
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ",
            )
            .bind(record.id)
            .bind(&record.source_queue)
            .bind(&record.event_type)
            .bind(&record.payload)
            .bind(&record.error_message)
            .bind(&record.stack_trace)
            .bind(record.attempt_count)
            .bind(record.first_attempt_at)
            .bind(record.failed_at)
            .bind(record.resolved)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::StorageError(e.to_string()))?;

            tracing::warn!(
                dead_letter_id = %record.id,
                source_queue = %record.source_queue,
                event_type = %record.event_type,
                attempt_count = record.attempt_count,
                error = %record.error_message,
                "Message added to dead-letter sink"
            );

            metrics::counter!(
                "dead_letter.recorded",
                "event_type" => record.event_type.clone()
            )
            .increment(1);

            Ok(())
        })
    }

    fn list_unresolved(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)]
            let rows = sqlx::query(
                r"
                SELECT id, source_queue, event_type, payload, error_message,
                       stack_trace, attempt_count, first_attempt_at,
                       failed_at, resolved
                FROM dead_letters
                WHERE resolved = FALSE
                ORDER BY failed_at ASC
                LIMIT $1
                ",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeadLetterError::StorageError(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_record).collect())
        })
    }

    fn mark_resolved(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE dead_letters
                SET resolved = TRUE
                WHERE id = $1
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::StorageError(e.to_string()))?;

            if result.rows_affected() == 0 {
                return Err(DeadLetterError::NotFound(id));
            }

            tracing::info!(dead_letter_id = %id, "Dead-letter record resolved");
            metrics::counter!("dead_letter.resolved").increment(1);
            Ok(())
        })
    }

    fn count_unresolved(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM dead_letters
                WHERE resolved = FALSE
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeadLetterError::StorageError(e.to_string()))?;

            Ok(count.unsigned_abs())
        })
    }
}
