//! # Outbox Relay
//!
//! Long-running service that moves durably persisted domain events from the
//! PostgreSQL outbox table onto a RabbitMQ broker: at-least-once delivery,
//! bounded retry with backoff, a circuit breaker around the broker, and an
//! HTTP surface for health probes and Prometheus metrics.
//!
//! Writers record events in the same transaction that mutates business
//! state; this service is the only component that publishes them.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod processor;
pub mod relay;

pub use config::Config;
pub use error::RelayError;
pub use metrics::RelayMetrics;
pub use processor::{BatchProcessor, BatchResult, ProcessorSettings};
pub use relay::{OutboxRelay, RelayState, RelayStats};
