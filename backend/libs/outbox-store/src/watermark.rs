//! Consumer watermarks: one row per `(consumer_name, event_id)` recording
//! that a downstream identity has fully processed an event. The relay reads
//! them to skip already-acknowledged work during claim and writes them on
//! successful publish. The primary key is the idempotency key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::PublishedRow;

/// A processed-event record as stored in `consumer_watermarks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerWatermark {
    pub consumer_name: String,
    pub event_id: Uuid,
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub processing_duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Watermark status written on successful publish.
pub const WATERMARK_COMPLETED: &str = "completed";

/// Upsert completed watermarks for a set of published rows inside an open
/// transaction. `ON CONFLICT DO NOTHING` makes replays no-ops: processing
/// the same `event_id` twice yields one inserted row and any number of
/// no-op upserts.
pub(crate) async fn upsert_completed(
    tx: &mut Transaction<'_, Postgres>,
    consumer_name: &str,
    rows: &[PublishedRow],
) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;

    for row in rows {
        let result = sqlx::query(
            r#"
            INSERT INTO consumer_watermarks (
                consumer_name,
                event_id,
                status,
                result,
                processing_duration_ms,
                processed_at
            ) VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (consumer_name, event_id) DO NOTHING
            "#,
        )
        .bind(consumer_name)
        .bind(row.event_id)
        .bind(WATERMARK_COMPLETED)
        .bind(serde_json::json!({ "published": true }))
        .bind(row.processing_duration_ms)
        .execute(&mut **tx)
        .await?;

        inserted += result.rows_affected();
    }

    Ok(inserted)
}

/// Read-side access to consumer watermarks, plus retention cleanup.
#[derive(Clone)]
pub struct WatermarkStore {
    pool: PgPool,
}

impl WatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check whether a consumer has already completed an event.
    pub async fn is_completed(&self, consumer_name: &str, event_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM consumer_watermarks
                WHERE consumer_name = $1 AND event_id = $2 AND status = $3
            ) AS completed
            "#,
        )
        .bind(consumer_name)
        .bind(event_id)
        .bind(WATERMARK_COMPLETED)
        .fetch_one(&self.pool)
        .await?;

        let completed: bool = row.try_get("completed")?;
        Ok(completed)
    }

    /// Fetch a watermark row, if present.
    pub async fn get(
        &self,
        consumer_name: &str,
        event_id: Uuid,
    ) -> StoreResult<Option<ConsumerWatermark>> {
        let row = sqlx::query(
            r#"
            SELECT
                consumer_name,
                event_id,
                status,
                result,
                processing_duration_ms,
                error_message,
                error_code,
                processed_at
            FROM consumer_watermarks
            WHERE consumer_name = $1 AND event_id = $2
            "#,
        )
        .bind(consumer_name)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let watermark = row
            .map(|row| -> Result<ConsumerWatermark, sqlx::Error> {
                Ok(ConsumerWatermark {
                    consumer_name: row.try_get("consumer_name")?,
                    event_id: row.try_get("event_id")?,
                    status: row.try_get("status")?,
                    result: row.try_get("result")?,
                    processing_duration_ms: row.try_get("processing_duration_ms")?,
                    error_message: row.try_get("error_message")?,
                    error_code: row.try_get("error_code")?,
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .transpose()?;

        Ok(watermark)
    }

    /// Delete watermarks older than the retention window. Returns the number
    /// of rows removed. Meant to run from a periodic maintenance job so the
    /// table does not grow without bound.
    pub async fn cleanup_older_than(&self, retention: Duration) -> StoreResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(30));

        let result = sqlx::query(
            r#"
            DELETE FROM consumer_watermarks
            WHERE processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, "Cleaned up old consumer watermarks");
        }

        Ok(deleted)
    }
}
