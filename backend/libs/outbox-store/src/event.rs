//! Outbox row model: status and priority enums, the stored event, and the
//! canonical wire envelope derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Raised when a stored column value does not map onto a known enum variant.
#[derive(Debug, Error)]
#[error("unknown {field} value: {value}")]
pub struct UnknownColumnValue {
    pub field: &'static str,
    pub value: String,
}

/// Lifecycle state of an outbox row.
///
/// `Published` and `Discarded` are terminal; once a row enters either it
/// never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Awaiting its first claim, or re-eligible after a retry delay.
    Pending,
    /// Exclusively claimed by one relay instance.
    Processing,
    /// Accepted by the broker. Terminal.
    Published,
    /// Publish failed; re-eligible once `next_attempt_at` passes.
    Failed,
    /// Retry budget exhausted. Terminal.
    Discarded,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Published,
        EventStatus::Failed,
        EventStatus::Discarded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Published => "published",
            EventStatus::Failed => "failed",
            EventStatus::Discarded => "discarded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Published | EventStatus::Discarded)
    }
}

impl std::str::FromStr for EventStatus {
    type Err = UnknownColumnValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "published" => Ok(EventStatus::Published),
            "failed" => Ok(EventStatus::Failed),
            "discarded" => Ok(EventStatus::Discarded),
            other => Err(UnknownColumnValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Stored as SMALLINT so `ORDER BY priority DESC` orders
/// critical rows first without a mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl EventPriority {
    pub fn as_i16(&self) -> i16 {
        match self {
            EventPriority::Low => 0,
            EventPriority::Normal => 1,
            EventPriority::High => 2,
            EventPriority::Critical => 3,
        }
    }

    pub fn from_i16(value: i16) -> Result<Self, UnknownColumnValue> {
        match value {
            0 => Ok(EventPriority::Low),
            1 => Ok(EventPriority::Normal),
            2 => Ok(EventPriority::High),
            3 => Ok(EventPriority::Critical),
            other => Err(UnknownColumnValue {
                field: "priority",
                value: other.to_string(),
            }),
        }
    }

    /// Critical events are published with persistent delivery (AMQP
    /// delivery_mode 2); everything else is transient.
    pub fn is_persistent(&self) -> bool {
        matches!(self, EventPriority::Critical)
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Normal
    }
}

/// One row of the outbox table.
///
/// Writers create rows inside their own transactions; the relay owns every
/// transition afterwards. `event_id` is the identity consumers deduplicate
/// on and is stable across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Opaque internal primary key.
    pub id: i64,

    /// Globally unique identifier of the domain event.
    pub event_id: Uuid,

    /// Classification triple.
    pub event_type: String,
    pub event_version: String,
    pub event_domain: String,

    /// Origin of the event.
    pub source_service: String,
    pub source_entity_type: String,
    pub source_entity_id: String,

    /// Tracing lineage.
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub parent_event_id: Option<Uuid>,

    /// Opaque structured body; never parsed by the relay.
    pub payload: Value,

    /// Arbitrary extensions, merged into broker headers.
    pub metadata: Option<Value>,

    /// Encoding label attached to the published message.
    pub content_type: String,

    pub priority: EventPriority,

    /// Broker destination.
    pub exchange: String,
    pub routing_key: String,

    pub status: EventStatus,

    /// Incremented once per claim; never exceeds `max_attempts`.
    pub attempts: i32,
    pub max_attempts: i32,

    /// Earliest wall-clock time the row may be re-claimed.
    pub next_attempt_at: DateTime<Utc>,

    /// Domain timestamp; ordering key within a priority band.
    pub occurred_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Last failure reason.
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl OutboxEvent {
    /// Build the canonical wire envelope for this event.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            id: self.event_id,
            event_type: self.event_type.clone(),
            version: self.event_version.clone(),
            domain: self.event_domain.clone(),
            source: EventSource {
                service: self.source_service.clone(),
                entity_type: self.source_entity_type.clone(),
                entity_id: self.source_entity_id.clone(),
            },
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            parent_event_id: self.parent_event_id,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            timestamp: self.occurred_at,
        }
    }
}

/// Origin block of the wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub service: String,
    pub entity_type: String,
    pub entity_id: String,
}

/// The canonical JSON body published to the broker.
///
/// Consumers rely on this shape; field names are part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub domain: String,
    pub source: EventSource,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub parent_event_id: Option<Uuid>,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// A new row to insert into the outbox. Writers call this inside the same
/// transaction that mutates business state.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: String,
    pub event_domain: String,
    pub source_service: String,
    pub source_entity_type: String,
    pub source_entity_id: String,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub parent_event_id: Option<Uuid>,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub content_type: String,
    pub priority: EventPriority,
    pub exchange: String,
    pub routing_key: String,
    pub max_attempts: i32,
    pub occurred_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    /// Minimal constructor; everything else starts from sensible defaults
    /// and can be overridden with the `with_*` builders.
    pub fn new(
        event_type: impl Into<String>,
        event_domain: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            event_version: "1.0".to_string(),
            event_domain: event_domain.into(),
            source_service: String::new(),
            source_entity_type: String::new(),
            source_entity_id: String::new(),
            correlation_id: None,
            causation_id: None,
            parent_event_id: None,
            payload,
            metadata: None,
            content_type: "application/json".to_string(),
            priority: EventPriority::Normal,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            max_attempts: 3,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_source(
        mut self,
        service: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.source_service = service.into();
        self.source_entity_type = entity_type.into();
        self.source_entity_id = entity_id.into();
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
