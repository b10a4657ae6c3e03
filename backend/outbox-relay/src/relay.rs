//! Relay supervisor: lifecycle, the periodic tick task, in-memory
//! statistics, and graceful shutdown coordination.
//!
//! Lifecycle: `stopped → starting → running → stopping → stopped`, with
//! `error` reachable from any non-terminal state on unrecoverable
//! initialisation failure. Shutdown never cancels an in-flight publish:
//! the current cycle either completes or the publish times out on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amqp_publisher::MessagePublisher;
use chrono::{DateTime, Utc};
use outbox_store::OutboxStore;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{RelayMode, RelaySettings};
use crate::error::RelayError;
use crate::processor::{BatchProcessor, BatchResult};

/// Smoothing factor for the per-event processing time average.
const EWMA_ALPHA: f64 = 0.1;

/// How often shutdown polls for the in-flight cycle to finish.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelayState::Stopped => "stopped",
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Stopping => "stopping",
            RelayState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Startup probe projection of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupStatus {
    Starting,
    Started,
    #[serde(rename = "timeout")]
    TimedOut,
}

/// Serializable summary of the last completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub discarded: usize,
    pub skipped: bool,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl From<&BatchResult> for BatchSummary {
    fn from(result: &BatchResult) -> Self {
        Self {
            claimed: result.claimed,
            published: result.published,
            failed: result.failed,
            discarded: result.discarded,
            skipped: result.skipped,
            duration_ms: result.duration.as_millis().min(u64::MAX as u128) as u64,
            errors: result.errors.clone(),
            finished_at: Utc::now(),
        }
    }
}

/// In-memory supervisor statistics. Everything is monotonic except
/// `last_batch`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub total_batches: u64,
    pub events_processed: u64,
    pub events_published: u64,
    pub events_failed: u64,
    pub events_discarded: u64,
    /// Rolling average of claimed rows per cycle.
    pub avg_batch_size: f64,
    /// Exponentially-weighted moving average of per-event processing time.
    pub avg_event_processing_ms: f64,
    pub last_batch: Option<BatchSummary>,
    #[serde(skip)]
    ewma_seeded: bool,
}

pub struct OutboxRelay {
    processor: Arc<BatchProcessor>,
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    settings: RelaySettings,
    batch_interval: Duration,
    state: RwLock<RelayState>,
    stats: Mutex<RelayStats>,
    shutdown: Notify,
    shutting_down: AtomicBool,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl OutboxRelay {
    pub fn new(
        processor: Arc<BatchProcessor>,
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        settings: RelaySettings,
        batch_interval: Duration,
    ) -> Self {
        Self {
            processor,
            store,
            publisher,
            settings,
            batch_interval,
            state: RwLock::new(RelayState::Stopped),
            stats: Mutex::new(RelayStats::default()),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            tick_handle: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state.read()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().clone()
    }

    pub fn processor(&self) -> &BatchProcessor {
        &self.processor
    }

    pub fn startup_status(&self) -> StartupStatus {
        match self.state() {
            RelayState::Starting => {
                let elapsed = (*self.started_at.lock())
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.settings.startup_timeout() {
                    StartupStatus::TimedOut
                } else {
                    StartupStatus::Starting
                }
            }
            _ => StartupStatus::Started,
        }
    }

    fn set_state(&self, to: RelayState) {
        let mut state = self.state.write();
        let from = *state;
        if from != to {
            info!(from = %from, to = %to, "Relay state change");
            *state = to;
        }
    }

    /// Initialise collaborators and begin processing.
    ///
    /// The store must be reachable; the broker is dialed lazily and an
    /// outage there is the circuit breaker's problem, not a startup
    /// failure.
    pub async fn start(self: &Arc<Self>) -> Result<(), RelayError> {
        self.set_state(RelayState::Starting);
        *self.started_at.lock() = Some(Instant::now());

        if let Err(e) = self.store.ping().await {
            self.set_state(RelayState::Error);
            return Err(RelayError::Storage(e));
        }

        if self.settings.process_on_startup {
            let result = self.run_cycle(None).await;
            debug!(
                claimed = result.claimed,
                published = result.published,
                "Startup cycle complete"
            );
        }

        if self.settings.mode == RelayMode::Continuous {
            let relay = Arc::clone(self);
            let handle = tokio::spawn(async move { relay.tick_loop().await });
            *self.tick_handle.lock() = Some(handle);
        }

        self.set_state(RelayState::Running);
        info!(
            mode = ?self.settings.mode,
            consumer = %self.settings.consumer_name,
            interval_ms = self.batch_interval.as_millis() as u64,
            "Relay started"
        );
        Ok(())
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.batch_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately;
        // consume it so the first timed cycle lands one interval in.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.notified() => break,
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.run_cycle(None).await;
        }

        debug!("Tick loop exited");
    }

    /// Run one cycle now. Used by polling mode and the `process` command;
    /// refused once shutdown has begun.
    pub async fn trigger_batch(&self, batch_size: Option<i64>) -> BatchResult {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Shutdown in progress, refusing new cycle");
            return BatchResult::default();
        }
        self.run_cycle(batch_size).await
    }

    async fn run_cycle(&self, batch_size: Option<i64>) -> BatchResult {
        let result = self.processor.process_batch(batch_size).await;
        self.record_batch(&result);
        result
    }

    fn record_batch(&self, result: &BatchResult) {
        let mut stats = self.stats.lock();

        stats.total_batches += 1;
        stats.events_processed += result.claimed as u64;
        stats.events_published += result.published as u64;
        stats.events_failed += result.failed as u64;
        stats.events_discarded += result.discarded as u64;

        let n = stats.total_batches as f64;
        stats.avg_batch_size += (result.claimed as f64 - stats.avg_batch_size) / n;

        for duration in &result.event_durations {
            let ms = duration.as_secs_f64() * 1_000.0;
            if stats.ewma_seeded {
                stats.avg_event_processing_ms =
                    EWMA_ALPHA * ms + (1.0 - EWMA_ALPHA) * stats.avg_event_processing_ms;
            } else {
                stats.avg_event_processing_ms = ms;
                stats.ewma_seeded = true;
            }
        }

        stats.last_batch = Some(BatchSummary::from(result));
    }

    /// Graceful shutdown: refuse new cycles, wake the tick task, wait for
    /// the in-flight cycle up to the configured timeout, then close the
    /// publisher and the store.
    pub async fn stop(&self) {
        if matches!(self.state(), RelayState::Stopped | RelayState::Stopping) {
            return;
        }
        self.set_state(RelayState::Stopping);
        self.shutting_down.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so the tick task sees it even if it
        // is mid-cycle rather than parked on the select.
        self.shutdown.notify_one();

        let deadline = Instant::now() + self.settings.graceful_shutdown_timeout();
        while self.processor.is_processing() {
            if Instant::now() >= deadline {
                warn!(
                    timeout_ms = self.settings.graceful_shutdown_timeout_ms,
                    "Graceful shutdown timeout elapsed with a cycle still in flight, proceeding"
                );
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let handle = self.tick_handle.lock().take();
        if let Some(mut handle) = handle {
            // The loop exits on its own; abort only if it somehow lingers.
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        self.publisher.close().await;
        self.store.close().await;
        self.set_state(RelayState::Stopped);
        info!("Relay stopped");
    }
}
