//! `PostgreSQL` outbox store.
//!
//! The append path is the whole point of this store: it takes the caller's
//! open transaction, so the outbox record commits **iff** the business
//! mutation in that transaction commits. There is no window in which the
//! mutation exists without the record or vice versa.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE outbox_events (
//!     id              UUID PRIMARY KEY,
//!     event_type      TEXT NOT NULL,
//!     payload         TEXT NOT NULL,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     published       BOOLEAN NOT NULL DEFAULT FALSE,
//!     published_at    TIMESTAMPTZ,
//!     retry_count     INTEGER NOT NULL DEFAULT 0,
//!     last_error      TEXT,
//!     last_attempt_at TIMESTAMPTZ
//! );
//!
//! CREATE INDEX idx_outbox_pending
//!     ON outbox_events (created_at)
//!     WHERE published = FALSE;
//! ```

use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use steadfast_core::envelope::EventEnvelope;
use steadfast_core::outbox::{OutboxError, OutboxRecord, OutboxStore, truncate_error};
use uuid::Uuid;

/// `PostgreSQL`-backed [`OutboxStore`].
///
/// One instance per service, pointed at the service's own database — the
/// outbox deliberately lives next to the business tables it must commit
/// with.
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Create a store over the service's connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an envelope inside the caller's transaction.
    ///
    /// This must be called with the same transaction that performs the
    /// triggering business write. Committing the transaction makes both
    /// durable atomically; rolling it back discards both.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::StorageError`] if the envelope cannot
    /// serialize or the insert fails.
    pub async fn append(
        tx: &mut Transaction<'_, Postgres>,
        envelope: &EventEnvelope,
    ) -> Result<Uuid, OutboxError> {
        let payload = envelope
            .to_bytes()
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;
        let payload =
            String::from_utf8(payload).map_err(|e| OutboxError::StorageError(e.to_string()))?;

        let id = Uuid::new_v4();
        sqlx::query(
            r"
            INSERT INTO outbox_events (id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(id)
        .bind(&envelope.event_name)
        .bind(&payload)
        .bind(envelope.timestamp)
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::StorageError(e.to_string()))?;

        tracing::debug!(
            outbox_id = %id,
            event_type = %envelope.event_name,
            correlation_id = %envelope.correlation_id,
            "Outbox record staged in transaction"
        );

        Ok(id)
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> OutboxRecord {
        OutboxRecord {
            id: row.get("id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            created_at: row.get("created_at"),
            published: row.get("published"),
            published_at: row.get("published_at"),
            retry_count: row.get("retry_count"),
            last_error: row.get("last_error"),
            last_attempt_at: row.get("last_attempt_at"),
        }
    }

    /// Fetch one record by id, mostly for operational tooling.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if no record has this id.
    pub async fn get_by_id(&self, id: Uuid) -> Result<OutboxRecord, OutboxError> {
        let row = sqlx::query(
            r"
            SELECT id, event_type, payload, created_at, published,
                   published_at, retry_count, last_error, last_attempt_at
            FROM outbox_events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OutboxError::StorageError(e.to_string()))?;

        row.map(|r| Self::row_to_record(&r))
            .ok_or(OutboxError::NotFound(id))
    }
}

impl OutboxStore for PgOutboxStore {
    fn fetch_pending(
        &self,
        batch_size: usize,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)]
            let rows = sqlx::query(
                r"
                SELECT id, event_type, payload, created_at, published,
                       published_at, retry_count, last_error, last_attempt_at
                FROM outbox_events
                WHERE published = FALSE AND retry_count < $1
                ORDER BY created_at ASC
                LIMIT $2
                ",
            )
            .bind(max_retries)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;

            Ok(rows.iter().map(Self::row_to_record).collect())
        })
    }

    fn mark_published(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            // Guarded by `published = FALSE`, so repeat calls are no-ops
            // and `published_at` keeps its first value.
            sqlx::query(
                r"
                UPDATE outbox_events
                SET published = TRUE, published_at = NOW()
                WHERE id = $1 AND published = FALSE
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;

            metrics::counter!("outbox.store.published").increment(1);
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let error = truncate_error(error);
        Box::pin(async move {
            // Never resurrects a published record.
            sqlx::query(
                r"
                UPDATE outbox_events
                SET retry_count = retry_count + 1,
                    last_error = $2,
                    last_attempt_at = NOW()
                WHERE id = $1 AND published = FALSE
                ",
            )
            .bind(id)
            .bind(&error)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;

            metrics::counter!("outbox.store.failed").increment(1);
            Ok(())
        })
    }

    fn count_pending(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM outbox_events
                WHERE published = FALSE AND retry_count < $1
                ",
            )
            .bind(max_retries)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;

            Ok(count.unsigned_abs())
        })
    }

    fn count_exhausted(
        &self,
        max_retries: i32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM outbox_events
                WHERE published = FALSE AND retry_count >= $1
                ",
            )
            .bind(max_retries)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OutboxError::StorageError(e.to_string()))?;

            Ok(count.unsigned_abs())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Store behavior against a live database is covered by the in-memory
    // twin in steadfast-testing; these tests pin the pieces that do not
    // need a connection.

    #[test]
    fn truncation_applies_before_binding() {
        let long = "e".repeat(5000);
        assert!(truncate_error(&long).len() <= 512);
    }
}
