//! In-memory fakes for exercising the processor and supervisor without
//! PostgreSQL or RabbitMQ. The store fake honours the same state machine
//! contract as the SQL implementation.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use amqp_publisher::{MessagePublisher, OutboundMessage, PublishError, PublishResult};
use outbox_store::{
    EventPriority, EventStatus, OutboxEvent, OutboxStats, OutboxStore, PublishedRow,
    SettleFailureOutcome, StoreResult,
};

pub fn make_event(id: i64, max_attempts: i32) -> OutboxEvent {
    OutboxEvent {
        id,
        event_id: Uuid::new_v4(),
        event_type: "order.created".to_string(),
        event_version: "1.0".to_string(),
        event_domain: "orders".to_string(),
        source_service: "order-service".to_string(),
        source_entity_type: "order".to_string(),
        source_entity_id: format!("ord-{id}"),
        correlation_id: Some(Uuid::new_v4()),
        causation_id: None,
        parent_event_id: None,
        payload: json!({"n": id}),
        metadata: None,
        content_type: "application/json".to_string(),
        priority: EventPriority::Normal,
        exchange: "events".to_string(),
        routing_key: "orders.created".to_string(),
        status: EventStatus::Pending,
        attempts: 0,
        max_attempts,
        next_attempt_at: Utc::now() - ChronoDuration::seconds(1),
        occurred_at: Utc::now(),
        created_at: Utc::now(),
        published_at: None,
        failed_at: None,
        updated_at: Utc::now(),
        error_message: None,
        error_code: None,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<OutboxEvent>>,
    watermarks: Mutex<HashSet<(String, Uuid)>>,
    pub claim_calls: AtomicUsize,
    pub fail_claims: AtomicBool,
    pub fail_ping: AtomicBool,
    pub closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, event: OutboxEvent) {
        self.events.lock().push(event);
    }

    pub fn seed_new(&self, max_attempts: i32) -> i64 {
        let id = self.events.lock().len() as i64 + 1;
        self.seed(make_event(id, max_attempts));
        id
    }

    pub fn get(&self, row_id: i64) -> OutboxEvent {
        self.events
            .lock()
            .iter()
            .find(|e| e.id == row_id)
            .cloned()
            .expect("row exists")
    }

    pub fn status_of(&self, row_id: i64) -> EventStatus {
        self.get(row_id).status
    }

    pub fn has_watermark(&self, consumer: &str, event_id: Uuid) -> bool {
        self.watermarks
            .lock()
            .contains(&(consumer.to_string(), event_id))
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_batch(
        &self,
        batch_size: i64,
        consumer_name: &str,
        max_attempts_cap: i32,
    ) -> StoreResult<Vec<OutboxEvent>> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolClosed.into());
        }
        self.claim_calls.fetch_add(1, Ordering::SeqCst);

        if batch_size <= 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let watermarks = self.watermarks.lock().clone();
        let mut events = self.events.lock();

        let mut candidates: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                matches!(e.status, EventStatus::Pending | EventStatus::Failed)
                    && e.next_attempt_at <= now
                    && e.attempts < max_attempts_cap
                    && !watermarks.contains(&(consumer_name.to_string(), e.event_id))
            })
            .map(|(i, _)| i)
            .collect();

        candidates.sort_by(|&a, &b| {
            events[b]
                .priority
                .cmp(&events[a].priority)
                .then(events[a].occurred_at.cmp(&events[b].occurred_at))
        });
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::new();
        for index in candidates {
            let event = &mut events[index];
            event.status = EventStatus::Processing;
            event.attempts += 1;
            event.updated_at = now;
            claimed.push(event.clone());
        }

        Ok(claimed)
    }

    async fn settle_published(
        &self,
        rows: &[PublishedRow],
        consumer_name: &str,
    ) -> StoreResult<u64> {
        let mut events = self.events.lock();
        let mut watermarks = self.watermarks.lock();
        let mut settled = 0;

        for row in rows {
            if let Some(event) = events
                .iter_mut()
                .find(|e| e.id == row.row_id && e.status == EventStatus::Processing)
            {
                event.status = EventStatus::Published;
                event.published_at = Some(Utc::now());
                event.updated_at = Utc::now();
                settled += 1;
            }
            watermarks.insert((consumer_name.to_string(), row.event_id));
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
        let mut events = self.events.lock();
        let mut outcome = SettleFailureOutcome::default();
        let retry_after =
            ChronoDuration::from_std(retry_after).unwrap_or_else(|_| ChronoDuration::zero());

        for row_id in row_ids {
            if let Some(event) = events
                .iter_mut()
                .find(|e| e.id == *row_id && e.status == EventStatus::Processing)
            {
                event.error_message = Some(error_message.to_string());
                event.error_code = Some(error_code.to_string());
                event.updated_at = Utc::now();
                if event.attempts >= event.max_attempts {
                    event.status = EventStatus::Discarded;
                    event.failed_at = Some(Utc::now());
                    outcome.discarded += 1;
                } else {
                    event.status = EventStatus::Failed;
                    event.next_attempt_at = Utc::now() + retry_after;
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn stats(&self) -> StoreResult<OutboxStats> {
        let events = self.events.lock();
        let mut stats = OutboxStats::default();
        for event in events.iter() {
            match event.status {
                EventStatus::Pending => stats.pending += 1,
                EventStatus::Processing => stats.processing += 1,
                EventStatus::Published => stats.published += 1,
                EventStatus::Failed => stats.failed += 1,
                EventStatus::Discarded => stats.discarded += 1,
            }
            if event.status == EventStatus::Pending {
                stats.oldest_pending = Some(
                    stats
                        .oldest_pending
                        .map_or(event.occurred_at, |o| o.min(event.occurred_at)),
                );
                stats.newest_pending = Some(
                    stats
                        .newest_pending
                        .map_or(event.occurred_at, |n| n.max(event.occurred_at)),
                );
            }
        }
        Ok(stats)
    }

    async fn ping(&self) -> StoreResult<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolClosed.into());
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PublishBehavior {
    Succeed,
    FailTransport,
    FailTimeout,
    FailReturned,
    FailProtocol,
    /// Fail the first n calls with a transport error, then succeed.
    FailFirst(usize),
}

#[derive(Default)]
pub struct FakePublisher {
    behavior: Mutex<Option<PublishBehavior>>,
    pub calls: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
    pub closed: AtomicBool,
    pub reset_calls: AtomicUsize,
}

impl FakePublisher {
    pub fn new(behavior: PublishBehavior) -> Arc<Self> {
        let publisher = Self::default();
        *publisher.behavior.lock() = Some(behavior);
        Arc::new(publisher)
    }

    pub fn set_behavior(&self, behavior: PublishBehavior) {
        *self.behavior.lock() = Some(behavior);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    fn make_error(behavior: PublishBehavior) -> Option<PublishError> {
        match behavior {
            PublishBehavior::Succeed => None,
            PublishBehavior::FailTransport => {
                Some(PublishError::Transport("connection refused".to_string()))
            }
            PublishBehavior::FailTimeout => {
                Some(PublishError::Timeout(Duration::from_millis(10)))
            }
            PublishBehavior::FailReturned => {
                Some(PublishError::Returned("NO_ROUTE (312)".to_string()))
            }
            PublishBehavior::FailProtocol => {
                Some(PublishError::Protocol("ACCESS_REFUSED".to_string()))
            }
            PublishBehavior::FailFirst(_) => {
                Some(PublishError::Transport("connection refused".to_string()))
            }
        }
    }
}

#[async_trait]
impl MessagePublisher for FakePublisher {
    async fn publish(&self, _message: &OutboundMessage) -> PublishResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = (*self.behavior.lock()).unwrap_or(PublishBehavior::Succeed);
        let error = match behavior {
            PublishBehavior::FailFirst(n) if call >= n => None,
            other => Self::make_error(other),
        };

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn ping(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn reset(&self) {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
