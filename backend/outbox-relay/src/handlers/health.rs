//! Health, metrics, statistics, and admin HTTP surface.
//!
//! Liveness deliberately touches nothing external so a partial outage
//! cannot make the orchestrator restart a relay that is coping with it;
//! readiness checks the real dependencies.

use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use amqp_publisher::MessagePublisher;
use outbox_store::OutboxStore;
use resilience::CircuitBreaker;

use crate::relay::{OutboxRelay, RelayState, StartupStatus};

/// Aggregated state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<OutboxRelay>,
    pub store: Arc<dyn OutboxStore>,
    pub publisher: Arc<dyn MessagePublisher>,
    pub breaker: CircuitBreaker,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentCheck {
    status: ComponentStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
}

impl ComponentCheck {
    fn healthy(message: impl Into<String>, latency_ms: Option<u64>) -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: message.into(),
            latency_ms,
        }
    }

    fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: message.into(),
            latency_ms: None,
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == ComponentStatus::Healthy
    }
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    checks: HashMap<String, ComponentCheck>,
    timestamp: String,
}

#[derive(Serialize)]
struct LivenessResponse {
    status: &'static str,
    state: RelayState,
}

#[derive(Serialize)]
struct StartupResponse {
    status: StartupStatus,
}

/// Liveness: healthy unless the supervisor hit an unrecoverable error.
pub async fn liveness(state: web::Data<AppState>) -> impl Responder {
    let relay_state = state.relay.state();
    let body = LivenessResponse {
        status: if relay_state == RelayState::Error {
            "error"
        } else {
            "alive"
        },
        state: relay_state,
    };

    if relay_state == RelayState::Error {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

/// Readiness: running, store reachable, broker reachable, breaker not open.
pub async fn readiness(state: web::Data<AppState>) -> impl Responder {
    let mut checks = HashMap::new();

    let relay_state = state.relay.state();
    checks.insert(
        "relay".to_string(),
        if relay_state == RelayState::Running {
            ComponentCheck::healthy("running", None)
        } else {
            ComponentCheck::unhealthy(format!("relay is {relay_state}"))
        },
    );

    let started = Instant::now();
    checks.insert(
        "database".to_string(),
        match state.store.ping().await {
            Ok(()) => ComponentCheck::healthy(
                "connected",
                Some(started.elapsed().as_millis() as u64),
            ),
            Err(e) => {
                tracing::error!("Database readiness check failed: {}", e);
                ComponentCheck::unhealthy(e.to_string())
            }
        },
    );

    checks.insert(
        "broker".to_string(),
        if state.publisher.ping().await {
            ComponentCheck::healthy("connected", None)
        } else {
            ComponentCheck::unhealthy("broker connection down")
        },
    );

    let breaker_state = state.breaker.state();
    checks.insert(
        "circuit_breaker".to_string(),
        if state.breaker.is_open() {
            ComponentCheck::unhealthy("circuit breaker is open")
        } else {
            ComponentCheck::healthy(breaker_state.as_str(), None)
        },
    );

    let ready = checks.values().all(ComponentCheck::is_healthy);
    let body = ReadinessResponse {
        ready,
        checks,
        timestamp: Utc::now().to_rfc3339(),
    };

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Startup: "started" once the supervisor has left `starting`.
pub async fn startup(state: web::Data<AppState>) -> impl Responder {
    let status = state.relay.startup_status();
    let body = StartupResponse { status };
    match status {
        StartupStatus::Started => HttpResponse::Ok().json(body),
        StartupStatus::Starting | StartupStatus::TimedOut => {
            HttpResponse::ServiceUnavailable().json(body)
        }
    }
}

/// Supervisor statistics plus live outbox counts.
pub async fn stats(state: web::Data<AppState>) -> impl Responder {
    let outbox = match state.store.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::error!("Failed to read outbox stats: {}", e);
            None
        }
    };

    HttpResponse::Ok().json(serde_json::json!({
        "relay": state.relay.stats(),
        "state": state.relay.state(),
        "circuit_breaker": state.breaker.state().as_str(),
        "outbox": outbox,
    }))
}

/// Prometheus text exposition of the default registry.
pub async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

/// Force-close the circuit breaker and clear the publisher's reconnect
/// give-up state. Backs the `reset-cb` CLI command.
pub async fn reset_circuit_breaker(state: web::Data<AppState>) -> impl Responder {
    state.breaker.reset();
    state.publisher.reset().await;
    tracing::info!("Circuit breaker reset via admin endpoint");

    HttpResponse::Ok().json(serde_json::json!({
        "status": "reset",
        "circuit_breaker": state.breaker.state().as_str(),
    }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health/live", web::get().to(liveness))
        .route("/health/ready", web::get().to(readiness))
        .route("/health/startup", web::get().to(startup))
        .route("/stats", web::get().to(stats))
        .route("/metrics", web::get().to(metrics))
        .route(
            "/admin/circuit-breaker/reset",
            web::post().to(reset_circuit_breaker),
        );
}
