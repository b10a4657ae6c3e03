//! Prometheus metric families for the relay.
//!
//! Registered on the default registry; registration failures (e.g. a second
//! instance in the same process during tests) are logged and tolerated.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
};
use tracing::warn;

/// Breaker component label used across breaker metrics.
pub const BREAKER_COMPONENT: &str = "broker_publisher";

#[derive(Clone)]
pub struct RelayMetrics {
    /// counter{event_type, event_domain, exchange, routing_key}
    pub events_published: IntCounterVec,
    /// counter{event_type, event_domain, error_type}
    pub events_failed: IntCounterVec,
    /// counter{event_type, event_domain, attempt}
    pub events_retried: IntCounterVec,
    /// counter{event_type, event_domain, reason}
    pub events_discarded: IntCounterVec,
    /// counter{error_type, error_code}
    pub publish_errors: IntCounterVec,
    /// counter{component, from, to}
    pub circuit_breaker_trips: IntCounterVec,
    /// gauge{status}
    pub queue_depth: IntGaugeVec,
    /// gauge in {0, 1}
    pub broker_connection_status: IntGauge,
    /// gauge in {0, 1}
    pub db_connection_status: IntGauge,
    /// gauge{component} in {0 = closed, 1 = open, 2 = half_open}
    pub circuit_breaker_state: IntGaugeVec,
    pub event_processing_duration: Histogram,
    pub batch_processing_duration: Histogram,
    /// histogram{exchange, routing_key}
    pub publish_duration: HistogramVec,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Events accepted by the broker"),
            &["event_type", "event_domain", "exchange", "routing_key"],
        )
        .expect("valid metric opts for events_published_total");

        let events_failed = IntCounterVec::new(
            Opts::new("events_failed_total", "Events whose publish failed"),
            &["event_type", "event_domain", "error_type"],
        )
        .expect("valid metric opts for events_failed_total");

        let events_retried = IntCounterVec::new(
            Opts::new("events_retried_total", "Inner publish retries"),
            &["event_type", "event_domain", "attempt"],
        )
        .expect("valid metric opts for events_retried_total");

        let events_discarded = IntCounterVec::new(
            Opts::new(
                "events_discarded_total",
                "Events dropped after exhausting their attempt budget",
            ),
            &["event_type", "event_domain", "reason"],
        )
        .expect("valid metric opts for events_discarded_total");

        let publish_errors = IntCounterVec::new(
            Opts::new("publish_errors_total", "Publish failures by class"),
            &["error_type", "error_code"],
        )
        .expect("valid metric opts for publish_errors_total");

        let circuit_breaker_trips = IntCounterVec::new(
            Opts::new(
                "circuit_breaker_trips_total",
                "Circuit breaker state transitions",
            ),
            &["component", "from", "to"],
        )
        .expect("valid metric opts for circuit_breaker_trips_total");

        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Outbox rows per status"),
            &["status"],
        )
        .expect("valid metric opts for queue_depth");

        let broker_connection_status = IntGauge::new(
            "broker_connection_status",
            "1 while the broker connection is healthy",
        )
        .expect("valid metric opts for broker_connection_status");

        let db_connection_status = IntGauge::new(
            "db_connection_status",
            "1 while the outbox database is reachable",
        )
        .expect("valid metric opts for db_connection_status");

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Breaker state: 0 closed, 1 open, 2 half_open",
            ),
            &["component"],
        )
        .expect("valid metric opts for circuit_breaker_state");

        let event_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_processing_duration_seconds",
                "Per-event publish-and-settle time",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 14).expect("valid buckets")),
        )
        .expect("valid metric opts for event_processing_duration_seconds");

        let batch_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_processing_duration_seconds",
                "Whole-cycle duration",
            )
            .buckets(prometheus::exponential_buckets(0.005, 2.0, 14).expect("valid buckets")),
        )
        .expect("valid metric opts for batch_processing_duration_seconds");

        let publish_duration = HistogramVec::new(
            HistogramOpts::new(
                "publish_duration_seconds",
                "Single broker publish round-trip",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 14).expect("valid buckets")),
            &["exchange", "routing_key"],
        )
        .expect("valid metric opts for publish_duration_seconds");

        let registry = prometheus::default_registry();
        for metric in [
            Box::new(events_published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(events_failed.clone()),
            Box::new(events_retried.clone()),
            Box::new(events_discarded.clone()),
            Box::new(publish_errors.clone()),
            Box::new(circuit_breaker_trips.clone()),
            Box::new(queue_depth.clone()),
            Box::new(broker_connection_status.clone()),
            Box::new(db_connection_status.clone()),
            Box::new(circuit_breaker_state.clone()),
            Box::new(event_processing_duration.clone()),
            Box::new(batch_processing_duration.clone()),
            Box::new(publish_duration.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register relay metric: {}", e);
            }
        }

        Self {
            events_published,
            events_failed,
            events_retried,
            events_discarded,
            publish_errors,
            circuit_breaker_trips,
            queue_depth,
            broker_connection_status,
            db_connection_status,
            circuit_breaker_state,
            event_processing_duration,
            batch_processing_duration,
            publish_duration,
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
