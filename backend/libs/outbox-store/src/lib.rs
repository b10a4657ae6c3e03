//! # Outbox Store
//!
//! Durable storage for domain events awaiting publication, with the
//! concurrency-safe claim/settle primitives the relay is built on.
//!
//! Writers insert rows in the same database transaction that mutates
//! business state; the relay then drives each row through the state
//! machine `pending → processing → {published | failed | discarded}`.
//! `published` and `discarded` are terminal.
//!
//! The claim operation is a single atomic statement using
//! `FOR UPDATE SKIP LOCKED`, so any number of relay instances can run
//! against the same table and will never see the same row twice:
//!
//! ```text
//! writers ──INSERT──▶ outbox_events ◀──claim/settle── relay instances
//!                     consumer_watermarks ◀─upsert on publish─┘
//! ```
//!
//! Consumer watermarks (one row per `(consumer_name, event_id)`) record
//! completed work; the claim predicate skips events a consumer has already
//! acknowledged, and successful publishes upsert them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

mod error;
mod event;
pub mod watermark;

pub use error::{OutboxStoreError, StoreResult};
pub use event::{
    EventEnvelope, EventPriority, EventSource, EventStatus, NewOutboxEvent, OutboxEvent,
    UnknownColumnValue,
};
pub use watermark::{ConsumerWatermark, WatermarkStore, WATERMARK_COMPLETED};

/// Outcome of a successful publish, carried into settle-success so the
/// watermark row can record how long processing took.
#[derive(Debug, Clone)]
pub struct PublishedRow {
    pub row_id: i64,
    pub event_id: Uuid,
    pub processing_duration_ms: i64,
}

/// Counts returned by settle-failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettleFailureOutcome {
    /// Rows moved to `failed`, eligible for re-claim after the retry delay.
    pub failed: u64,
    /// Rows moved to `discarded` because their attempt budget is exhausted.
    pub discarded: u64,
}

/// Aggregate counts for dashboards and the health surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: i64,
    pub processing: i64,
    pub published: i64,
    pub failed: i64,
    pub discarded: i64,
    pub oldest_pending: Option<DateTime<Utc>>,
    pub newest_pending: Option<DateTime<Utc>>,
}

impl OutboxStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.published + self.failed + self.discarded
    }

    pub fn count_for(&self, status: EventStatus) -> i64 {
        match status {
            EventStatus::Pending => self.pending,
            EventStatus::Processing => self.processing,
            EventStatus::Published => self.published,
            EventStatus::Failed => self.failed,
            EventStatus::Discarded => self.discarded,
        }
    }
}

/// Store trait for the relay's claim/settle operations.
///
/// Abstracts the database so the batch processor can be exercised against
/// in-memory fakes.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `batch_size` due rows for `consumer_name`.
    ///
    /// Every returned row has been transitioned to `processing` with
    /// `attempts` incremented; concurrent callers never receive the same
    /// row. Rows already completed by the consumer (per the watermark
    /// table) are skipped. `batch_size <= 0` returns an empty batch
    /// without touching the database.
    async fn claim_batch(
        &self,
        batch_size: i64,
        consumer_name: &str,
        max_attempts_cap: i32,
    ) -> StoreResult<Vec<OutboxEvent>>;

    /// Mark rows as published and upsert their consumer watermarks, all in
    /// one transaction. Rows not currently in `processing` are silently
    /// ignored, which makes the call idempotent.
    async fn settle_published(
        &self,
        rows: &[PublishedRow],
        consumer_name: &str,
    ) -> StoreResult<u64>;

    /// Record a failed publish for a set of rows in one transaction.
    ///
    /// Rows whose attempt budget is exhausted move to `discarded`
    /// (terminal); the rest move to `failed` with
    /// `next_attempt_at = now() + retry_after`.
    async fn settle_failed(
        &self,
        row_ids: &[i64],
        error_message: &str,
        error_code: &str,
        retry_after: Duration,
    ) -> StoreResult<SettleFailureOutcome>;

    /// Counts per status plus the age bounds of the pending backlog.
    async fn stats(&self) -> StoreResult<OutboxStats>;

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> StoreResult<()>;

    /// Release underlying resources. Default is a no-op.
    async fn close(&self) {}
}

/// SQLx-based implementation of [`OutboxStore`] using PostgreSQL.
pub struct SqlxOutboxStore {
    pool: PgPool,
}

impl SqlxOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new event into the outbox within a caller-owned transaction.
    ///
    /// This is the writer-side primitive: committing the transaction makes
    /// the business mutation and the event durable together. Returns the
    /// row id.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO outbox_events (
                event_id,
                event_type,
                event_version,
                event_domain,
                source_service,
                source_entity_type,
                source_entity_id,
                correlation_id,
                causation_id,
                parent_event_id,
                payload,
                metadata,
                content_type,
                priority,
                exchange,
                routing_key,
                status,
                attempts,
                max_attempts,
                next_attempt_at,
                occurred_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, 'pending', 0, $17, NOW(), $18
            )
            RETURNING id
            "#,
        )
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(&event.event_version)
        .bind(&event.event_domain)
        .bind(&event.source_service)
        .bind(&event.source_entity_type)
        .bind(&event.source_entity_id)
        .bind(event.correlation_id)
        .bind(event.causation_id)
        .bind(event.parent_event_id)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(&event.content_type)
        .bind(event.priority.as_i16())
        .bind(&event.exchange)
        .bind(&event.routing_key)
        .bind(event.max_attempts)
        .bind(event.occurred_at)
        .fetch_one(&mut **tx)
        .await?;

        let id: i64 = row.try_get("id")?;

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            row_id = id,
            "Event inserted into outbox"
        );

        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn claim_batch(
        &self,
        batch_size: i64,
        consumer_name: &str,
        max_attempts_cap: i32,
    ) -> StoreResult<Vec<OutboxEvent>> {
        if batch_size <= 0 {
            return Ok(Vec::new());
        }

        // Select-and-mark in one statement. SKIP LOCKED is what lets
        // multiple relay instances claim disjoint row sets without
        // coordination.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT e.id
                FROM outbox_events AS e
                WHERE e.status IN ('pending', 'failed')
                  AND e.next_attempt_at <= NOW()
                  AND e.attempts < $3
                  AND NOT EXISTS (
                      SELECT 1
                      FROM consumer_watermarks AS w
                      WHERE w.consumer_name = $2
                        AND w.event_id = e.event_id
                        AND w.status = 'completed'
                  )
                ORDER BY e.priority DESC, e.occurred_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events
            SET status = 'processing',
                attempts = attempts + 1,
                updated_at = NOW()
            FROM claimable
            WHERE outbox_events.id = claimable.id
            RETURNING outbox_events.*
            "#,
        )
        .bind(batch_size)
        .bind(consumer_name)
        .bind(max_attempts_cap)
        .fetch_all(&self.pool)
        .await?;

        let mut events = rows
            .iter()
            .map(map_event_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        // UPDATE ... RETURNING does not guarantee row order; restore the
        // claim ordering so the batch is processed priority-first.
        sort_for_processing(&mut events);

        debug!(
            count = events.len(),
            consumer = consumer_name,
            "Claimed outbox batch"
        );

        Ok(events)
    }

    async fn settle_published(
        &self,
        rows: &[PublishedRow],
        consumer_name: &str,
    ) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.row_id).collect();

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published',
                published_at = NOW(),
                updated_at = NOW(),
                error_message = NULL,
                error_code = NULL
            WHERE id = ANY($1)
              AND status = 'processing'
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        watermark::upsert_completed(&mut tx, consumer_name, rows).await?;

        tx.commit().await?;

        let settled = result.rows_affected();
        if settled < rows.len() as u64 {
            // Replay or a row settled by another path; harmless.
            debug!(
                requested = rows.len(),
                settled, "Some rows were not in processing when settling"
            );
        }

        Ok(settled)
    }

    async fn settle_failed(
        &self,
        row_ids: &[i64],
        error_message: &str,
        error_code: &str,
        retry_after: Duration,
    ) -> StoreResult<SettleFailureOutcome> {
        if row_ids.is_empty() {
            return Ok(SettleFailureOutcome::default());
        }

        let retry_after_ms = retry_after.as_millis().min(i64::MAX as u128) as i64;

        let mut tx = self.pool.begin().await?;

        // attempts was already incremented at claim time, so the discard
        // boundary is `attempts >= max_attempts`.
        let rows = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = CASE WHEN attempts >= max_attempts
                              THEN 'discarded' ELSE 'failed' END,
                failed_at = CASE WHEN attempts >= max_attempts
                                 THEN NOW() ELSE failed_at END,
                next_attempt_at = CASE WHEN attempts >= max_attempts
                                       THEN next_attempt_at
                                       ELSE NOW() + ($4 * INTERVAL '1 millisecond') END,
                error_message = $2,
                error_code = $3,
                updated_at = NOW()
            WHERE id = ANY($1)
              AND status = 'processing'
            RETURNING (status = 'discarded') AS discarded
            "#,
        )
        .bind(row_ids)
        .bind(error_message)
        .bind(error_code)
        .bind(retry_after_ms)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut outcome = SettleFailureOutcome::default();
        for row in &rows {
            let discarded: bool = row.try_get("discarded")?;
            if discarded {
                outcome.discarded += 1;
            } else {
                outcome.failed += 1;
            }
        }

        if outcome.discarded > 0 {
            warn!(
                discarded = outcome.discarded,
                error_code, "Events exhausted their attempt budget and were discarded"
            );
        }

        Ok(outcome)
    }

    async fn stats(&self) -> StoreResult<OutboxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')    AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'published')  AS published,
                COUNT(*) FILTER (WHERE status = 'failed')     AS failed,
                COUNT(*) FILTER (WHERE status = 'discarded')  AS discarded,
                MIN(occurred_at) FILTER (WHERE status = 'pending') AS oldest_pending,
                MAX(occurred_at) FILTER (WHERE status = 'pending') AS newest_pending
            FROM outbox_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            published: row.try_get("published")?,
            failed: row.try_get("failed")?,
            discarded: row.try_get("discarded")?,
            oldest_pending: row.try_get("oldest_pending")?,
            newest_pending: row.try_get("newest_pending")?,
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Restore the claim ordering: priority descending, then occurred_at
/// ascending. Ties within a (priority, occurred_at) pair stay arbitrary.
pub(crate) fn sort_for_processing(events: &mut [OutboxEvent]) {
    events.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.occurred_at.cmp(&b.occurred_at))
    });
}

fn map_event_row(row: &PgRow) -> Result<OutboxEvent, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<EventStatus>()
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;

    let priority: i16 = row.try_get("priority")?;
    let priority = EventPriority::from_i16(priority).map_err(|e| sqlx::Error::ColumnDecode {
        index: "priority".to_string(),
        source: Box::new(e),
    })?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        event_version: row.try_get("event_version")?,
        event_domain: row.try_get("event_domain")?,
        source_service: row.try_get("source_service")?,
        source_entity_type: row.try_get("source_entity_type")?,
        source_entity_id: row.try_get("source_entity_id")?,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        parent_event_id: row.try_get("parent_event_id")?,
        payload: row.try_get("payload")?,
        metadata: row.try_get("metadata")?,
        content_type: row.try_get("content_type")?,
        priority,
        exchange: row.try_get("exchange")?,
        routing_key: row.try_get("routing_key")?,
        status,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        occurred_at: row.try_get("occurred_at")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        failed_at: row.try_get("failed_at")?,
        updated_at: row.try_get("updated_at")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event_with(priority: EventPriority, occurred_secs: i64) -> OutboxEvent {
        OutboxEvent {
            id: 0,
            event_id: Uuid::new_v4(),
            event_type: "test.event".to_string(),
            event_version: "1.0".to_string(),
            event_domain: "test".to_string(),
            source_service: "test-service".to_string(),
            source_entity_type: "entity".to_string(),
            source_entity_id: "1".to_string(),
            correlation_id: None,
            causation_id: None,
            parent_event_id: None,
            payload: json!({}),
            metadata: None,
            content_type: "application/json".to_string(),
            priority,
            exchange: "events".to_string(),
            routing_key: "test".to_string(),
            status: EventStatus::Processing,
            attempts: 1,
            max_attempts: 3,
            next_attempt_at: Utc::now(),
            occurred_at: Utc.timestamp_opt(occurred_secs, 0).unwrap(),
            created_at: Utc::now(),
            published_at: None,
            failed_at: None,
            updated_at: Utc::now(),
            error_message: None,
            error_code: None,
        }
    }

    #[test]
    fn processing_order_is_priority_desc_then_occurred_asc() {
        let mut events = vec![
            event_with(EventPriority::Normal, 100),
            event_with(EventPriority::Critical, 300),
            event_with(EventPriority::Normal, 50),
            event_with(EventPriority::High, 200),
        ];

        sort_for_processing(&mut events);

        assert_eq!(events[0].priority, EventPriority::Critical);
        assert_eq!(events[1].priority, EventPriority::High);
        assert_eq!(events[2].priority, EventPriority::Normal);
        assert_eq!(events[2].occurred_at.timestamp(), 50);
        assert_eq!(events[3].occurred_at.timestamp(), 100);
    }

    #[test]
    fn stats_count_lookup_matches_fields() {
        let stats = OutboxStats {
            pending: 5,
            processing: 1,
            published: 10,
            failed: 2,
            discarded: 1,
            oldest_pending: None,
            newest_pending: None,
        };
        assert_eq!(stats.total(), 19);
        assert_eq!(stats.count_for(EventStatus::Pending), 5);
        assert_eq!(stats.count_for(EventStatus::Discarded), 1);
    }
}
