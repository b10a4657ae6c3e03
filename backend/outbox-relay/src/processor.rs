//! Batch processor: one claim → publish → settle cycle.
//!
//! Claims a batch from the store, pushes each event through the circuit
//! breaker into the publisher with a bounded inner retry loop, then settles
//! every row according to its outcome. No error escapes a cycle; failures
//! end up in row state and in the batch result.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amqp_publisher::{MessagePublisher, OutboundMessage, PublishError};
use outbox_store::{EventStatus, OutboxEvent, OutboxStore, PublishedRow};
use resilience::{CircuitBreaker, CircuitBreakerError, RetryPolicy};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::metrics::{RelayMetrics, BREAKER_COMPONENT};

/// Ceiling on publish attempts within a single cycle, regardless of how
/// much of the row's attempt budget remains.
const MAX_INNER_ATTEMPTS: u32 = 3;

/// Reason label for discards driven by attempt exhaustion.
const DISCARD_REASON_MAX_ATTEMPTS: &str = "max_attempts_reached";

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub discarded: usize,
    /// True when the store was unreachable and the cycle did nothing.
    pub skipped: bool,
    pub errors: Vec<String>,
    pub duration: Duration,
    /// Per-event publish-and-settle time, in claim order.
    pub event_durations: Vec<Duration>,
}

/// Processor knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub batch_size: i64,
    pub max_batch_size: i64,
    pub consumer_name: String,
    /// Claim predicate cap on row attempts.
    pub max_attempts_cap: i32,
}

enum PublishOutcome {
    Published,
    CircuitOpen,
    Failed(PublishError),
}

pub struct BatchProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    metrics: RelayMetrics,
    settings: ProcessorSettings,
    processing: AtomicBool,
}

/// Clears the processing flag when a cycle ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        metrics: RelayMetrics,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            breaker,
            retry,
            metrics,
            settings,
            processing: AtomicBool::new(false),
        }
    }

    /// True while a cycle is running on this instance.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    fn try_begin(&self) -> Option<ProcessingGuard<'_>> {
        self.processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ProcessingGuard(&self.processing))
    }

    /// Run one cycle. Re-entrant calls return an empty result without
    /// touching anything.
    pub async fn process_batch(&self, batch_size_override: Option<i64>) -> BatchResult {
        let _guard = match self.try_begin() {
            Some(guard) => guard,
            None => {
                debug!("Cycle already in progress on this instance, skipping");
                return BatchResult::default();
            }
        };

        let started = Instant::now();
        let mut result = BatchResult::default();

        let batch_size = batch_size_override
            .unwrap_or(self.settings.batch_size)
            .min(self.settings.max_batch_size);
        if batch_size <= 0 {
            return result;
        }

        let events = match self
            .store
            .claim_batch(
                batch_size,
                &self.settings.consumer_name,
                self.settings.max_attempts_cap,
            )
            .await
        {
            Ok(events) => {
                self.metrics.db_connection_status.set(1);
                events
            }
            Err(e) => {
                if e.is_unavailable() {
                    self.metrics.db_connection_status.set(0);
                    result.skipped = true;
                    warn!(error = %e, "Outbox store unavailable, skipping cycle");
                } else {
                    error!(error = %e, "Claim failed");
                }
                result.errors.push(format!("claim: {e}"));
                result.duration = started.elapsed();
                return result;
            }
        };

        result.claimed = events.len();
        if events.is_empty() {
            self.refresh_gauges().await;
            result.duration = started.elapsed();
            return result;
        }

        debug!(count = events.len(), "Processing claimed batch");

        // Publish each event in claim order and collect outcomes.
        let mut published_rows: Vec<PublishedRow> = Vec::new();
        let mut discard_set = FailureSet::default();
        let mut fail_set = FailureSet::default();
        let mut open_set = FailureSet::new("circuit breaker open", "circuit_open");

        for event in &events {
            let event_started = Instant::now();
            let outcome = self.publish_event(event).await;
            let elapsed = event_started.elapsed();

            self.metrics
                .event_processing_duration
                .observe(elapsed.as_secs_f64());
            result.event_durations.push(elapsed);

            match outcome {
                PublishOutcome::Published => {
                    self.metrics
                        .events_published
                        .with_label_values(&[
                            &event.event_type,
                            &event.event_domain,
                            &event.exchange,
                            &event.routing_key,
                        ])
                        .inc();
                    published_rows.push(PublishedRow {
                        row_id: event.id,
                        event_id: event.event_id,
                        processing_duration_ms: elapsed.as_millis().min(i64::MAX as u128) as i64,
                    });
                }
                PublishOutcome::CircuitOpen => {
                    self.metrics
                        .events_failed
                        .with_label_values(&[
                            &event.event_type,
                            &event.event_domain,
                            "circuit_open",
                        ])
                        .inc();
                    open_set.ids.push(event.id);
                }
                PublishOutcome::Failed(err) => {
                    self.metrics
                        .events_failed
                        .with_label_values(&[&event.event_type, &event.event_domain, err.code()])
                        .inc();

                    // attempts was incremented at claim time; at the cap the
                    // row has no budget left and must be discarded.
                    if event.attempts >= event.max_attempts {
                        self.metrics
                            .events_discarded
                            .with_label_values(&[
                                &event.event_type,
                                &event.event_domain,
                                DISCARD_REASON_MAX_ATTEMPTS,
                            ])
                            .inc();
                        discard_set.push(event.id, &err);
                    } else {
                        fail_set.push(event.id, &err);
                    }
                }
            }
        }

        // Settle each partition. The store moves discard candidates to
        // their terminal state; fail candidates come back after the first
        // retry delay; breaker refusals come back as soon as it can close.
        result.published = self
            .settle_published(&published_rows, &mut result.errors)
            .await;
        let discarded = self
            .settle_failed(&discard_set, Duration::ZERO, &mut result.errors)
            .await;
        let failed = self
            .settle_failed(&fail_set, self.retry.delay_for_attempt(1), &mut result.errors)
            .await;
        let open_settled = self
            .settle_failed(&open_set, self.retry.initial_delay, &mut result.errors)
            .await;

        result.discarded =
            (discarded.discarded + failed.discarded + open_settled.discarded) as usize;
        result.failed = (discarded.failed + failed.failed + open_settled.failed) as usize;

        self.refresh_gauges().await;

        result.duration = started.elapsed();
        self.metrics
            .batch_processing_duration
            .observe(result.duration.as_secs_f64());

        info!(
            claimed = result.claimed,
            published = result.published,
            failed = result.failed,
            discarded = result.discarded,
            duration_ms = result.duration.as_millis() as u64,
            "Batch cycle complete"
        );

        result
    }

    /// Publish one event with the inner retry loop.
    ///
    /// The claim already consumed one unit of the row's attempt budget, so
    /// the number of broker calls this cycle may make is
    /// `min(max_attempts - attempts + 1, MAX_INNER_ATTEMPTS)`. Retries stop
    /// immediately on non-retriable errors and when the breaker opens.
    async fn publish_event(&self, event: &OutboxEvent) -> PublishOutcome {
        let message = match build_message(event) {
            Ok(message) => message,
            Err(e) => {
                error!(event_id = %event.event_id, error = %e, "Could not build outbound message");
                return PublishOutcome::Failed(e);
            }
        };

        let budget = inner_attempt_budget(event.attempts, event.max_attempts);
        let mut last_error: Option<PublishError> = None;

        for attempt in 1..=budget {
            let publish_started = Instant::now();
            let outcome = self.breaker.call(|| self.publisher.publish(&message)).await;
            self.metrics
                .publish_duration
                .with_label_values(&[&event.exchange, &event.routing_key])
                .observe(publish_started.elapsed().as_secs_f64());

            match outcome {
                Ok(()) => {
                    self.metrics.broker_connection_status.set(1);
                    return PublishOutcome::Published;
                }
                Err(CircuitBreakerError::Open) => {
                    debug!(event_id = %event.event_id, "Circuit open, not publishing");
                    return PublishOutcome::CircuitOpen;
                }
                Err(CircuitBreakerError::CallFailed(e)) => {
                    self.metrics
                        .publish_errors
                        .with_label_values(&[e.kind(), e.code()])
                        .inc();

                    warn!(
                        event_id = %event.event_id,
                        correlation_id = ?event.correlation_id,
                        attempt,
                        budget,
                        error = %e,
                        "Publish attempt failed"
                    );

                    let retriable = e.is_retriable();
                    last_error = Some(e);

                    if !retriable || attempt == budget {
                        break;
                    }

                    self.metrics
                        .events_retried
                        .with_label_values(&[
                            &event.event_type,
                            &event.event_domain,
                            &attempt.to_string(),
                        ])
                        .inc();
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                }
            }
        }

        PublishOutcome::Failed(last_error.unwrap_or_else(|| {
            PublishError::Transport("publish attempts exhausted".to_string())
        }))
    }

    async fn settle_published(
        &self,
        rows: &[PublishedRow],
        errors: &mut Vec<String>,
    ) -> usize {
        if rows.is_empty() {
            return 0;
        }
        match self
            .store
            .settle_published(rows, &self.settings.consumer_name)
            .await
        {
            Ok(_) => rows.len(),
            Err(e) => {
                // The messages are on the broker; the rows will be claimed
                // again and consumers deduplicate on event_id.
                error!(error = %e, count = rows.len(), "Failed to settle published rows");
                errors.push(format!("settle-published: {e}"));
                0
            }
        }
    }

    async fn settle_failed(
        &self,
        set: &FailureSet,
        retry_after: Duration,
        errors: &mut Vec<String>,
    ) -> outbox_store::SettleFailureOutcome {
        if set.ids.is_empty() {
            return outbox_store::SettleFailureOutcome::default();
        }
        match self
            .store
            .settle_failed(&set.ids, &set.message, &set.code, retry_after)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, count = set.ids.len(), "Failed to settle failed rows");
                errors.push(format!("settle-failed: {e}"));
                outbox_store::SettleFailureOutcome::default()
            }
        }
    }

    /// Refresh the operator-facing gauges from live state.
    async fn refresh_gauges(&self) {
        if let Ok(stats) = self.store.stats().await {
            for status in EventStatus::ALL {
                self.metrics
                    .queue_depth
                    .with_label_values(&[status.as_str()])
                    .set(stats.count_for(status));
            }
        }

        let broker_up = self.publisher.ping().await;
        self.metrics
            .broker_connection_status
            .set(if broker_up { 1 } else { 0 });
        self.metrics
            .circuit_breaker_state
            .with_label_values(&[BREAKER_COMPONENT])
            .set(self.breaker.state().as_gauge_value());
    }
}

/// A settle-failure partition with its representative error.
#[derive(Default)]
struct FailureSet {
    ids: Vec<i64>,
    message: String,
    code: String,
}

impl FailureSet {
    fn new(message: &str, code: &str) -> Self {
        Self {
            ids: Vec::new(),
            message: message.to_string(),
            code: code.to_string(),
        }
    }

    /// The first failure in the set supplies the recorded error.
    fn push(&mut self, id: i64, error: &PublishError) {
        if self.ids.is_empty() {
            self.message = error.to_string();
            self.code = error.code().to_string();
        }
        self.ids.push(id);
    }
}

/// Broker calls allowed for this row in this cycle. `attempts` is the
/// post-claim value, so one unit of budget is already spent on this cycle.
fn inner_attempt_budget(attempts: i32, max_attempts: i32) -> u32 {
    let remaining = (max_attempts - attempts + 1).max(1);
    (remaining as u32).min(MAX_INNER_ATTEMPTS)
}

/// Derive the outbound message from an outbox row: canonical JSON envelope
/// body plus the publish attributes and merged headers.
fn build_message(event: &OutboxEvent) -> Result<OutboundMessage, PublishError> {
    let body = serde_json::to_vec(&event.envelope())
        .map_err(|e| PublishError::Protocol(format!("envelope serialization failed: {e}")))?;

    let mut headers: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    if let Some(serde_json::Value::Object(map)) = &event.metadata {
        for (key, value) in map {
            headers.insert(key.clone(), value.clone());
        }
    }
    // Fixed identity keys win over metadata on collision.
    headers.insert("event_id".to_string(), json!(event.event_id.to_string()));
    headers.insert("event_type".to_string(), json!(event.event_type));
    headers.insert("event_version".to_string(), json!(event.event_version));
    headers.insert("event_domain".to_string(), json!(event.event_domain));
    headers.insert("source_service".to_string(), json!(event.source_service));
    headers.insert(
        "source_entity_type".to_string(),
        json!(event.source_entity_type),
    );
    headers.insert("source_entity_id".to_string(), json!(event.source_entity_id));
    if let Some(causation_id) = event.causation_id {
        headers.insert("causation_id".to_string(), json!(causation_id.to_string()));
    }
    if let Some(parent_event_id) = event.parent_event_id {
        headers.insert(
            "parent_event_id".to_string(),
            json!(parent_event_id.to_string()),
        );
    }
    headers.insert("attempts".to_string(), json!(event.attempts));

    Ok(OutboundMessage {
        exchange: event.exchange.clone(),
        routing_key: event.routing_key.clone(),
        body,
        message_id: event.event_id.to_string(),
        correlation_id: event.correlation_id.map(|id| id.to_string()),
        timestamp_secs: event.occurred_at.timestamp().max(0) as u64,
        content_type: event.content_type.clone(),
        headers,
        persistent: event.priority.is_persistent(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outbox_store::EventPriority;
    use uuid::Uuid;

    fn event(attempts: i32, max_attempts: i32) -> OutboxEvent {
        OutboxEvent {
            id: 7,
            event_id: Uuid::new_v4(),
            event_type: "order.created".to_string(),
            event_version: "1.0".to_string(),
            event_domain: "orders".to_string(),
            source_service: "order-service".to_string(),
            source_entity_type: "order".to_string(),
            source_entity_id: "ord-1".to_string(),
            correlation_id: Some(Uuid::new_v4()),
            causation_id: Some(Uuid::new_v4()),
            parent_event_id: None,
            payload: json!({"total": 9}),
            metadata: Some(json!({"tenant": "acme", "attempts": "spoofed"})),
            content_type: "application/json".to_string(),
            priority: EventPriority::Critical,
            exchange: "events".to_string(),
            routing_key: "orders.created".to_string(),
            status: EventStatus::Processing,
            attempts,
            max_attempts,
            next_attempt_at: Utc::now(),
            occurred_at: Utc::now(),
            created_at: Utc::now(),
            published_at: None,
            failed_at: None,
            updated_at: Utc::now(),
            error_message: None,
            error_code: None,
        }
    }

    #[test]
    fn budget_shrinks_as_attempts_accumulate() {
        // Fresh row (claim made attempts 1 of 3): full inner budget.
        assert_eq!(inner_attempt_budget(1, 3), 3);
        // Second cycle: two units of budget left.
        assert_eq!(inner_attempt_budget(2, 3), 2);
        // Final cycle: one shot.
        assert_eq!(inner_attempt_budget(3, 3), 1);
        // max_attempts = 1: single shot, first failure discards.
        assert_eq!(inner_attempt_budget(1, 1), 1);
        // Large budgets are capped.
        assert_eq!(inner_attempt_budget(1, 100), MAX_INNER_ATTEMPTS);
    }

    #[test]
    fn message_carries_identity_headers_and_persistence() {
        let event = event(1, 3);
        let message = build_message(&event).unwrap();

        assert_eq!(message.message_id, event.event_id.to_string());
        assert!(message.persistent, "critical priority must be persistent");
        assert_eq!(message.exchange, "events");
        assert_eq!(message.routing_key, "orders.created");
        assert_eq!(
            message.headers.get("event_type"),
            Some(&json!("order.created"))
        );
        assert_eq!(message.headers.get("tenant"), Some(&json!("acme")));
        // Fixed keys beat metadata collisions.
        assert_eq!(message.headers.get("attempts"), Some(&json!(1)));
        assert!(message.headers.contains_key("causation_id"));
        assert!(!message.headers.contains_key("parent_event_id"));

        let body: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(body["type"], json!("order.created"));
        assert_eq!(body["source"]["entityId"], json!("ord-1"));
    }

    #[test]
    fn normal_priority_is_transient() {
        let mut event = event(1, 3);
        event.priority = EventPriority::Normal;
        let message = build_message(&event).unwrap();
        assert!(!message.persistent);
    }

    #[test]
    fn failure_set_keeps_the_first_error() {
        let mut set = FailureSet::default();
        set.push(1, &PublishError::Timeout(Duration::from_secs(5)));
        set.push(2, &PublishError::Protocol("later".into()));

        assert_eq!(set.ids, vec![1, 2]);
        assert_eq!(set.code, "publish_timeout");
    }
}
