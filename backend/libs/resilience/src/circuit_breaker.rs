/// Circuit Breaker with failure/success thresholds
///
/// State transitions:
/// - Closed → Open: when the failure counter reaches failure_threshold
/// - Open → HalfOpen: after timeout duration
/// - HalfOpen → Closed: when success count reaches success_threshold
/// - HalfOpen → Open: on any failure (the open timer restarts)
///
/// In Closed, a success decrements the failure counter toward zero, so a
/// flaky-but-mostly-healthy dependency does not accumulate failures forever.
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Testing if the dependency recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for gauges: 0 = closed, 1 = open, 2 = half_open.
    pub fn as_gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure count that trips the circuit open
    pub failure_threshold: u32,
    /// Success count in HalfOpen that closes the circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub timeout: Duration,
    /// When false the breaker is a transparent pass-through
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Observer invoked on every state transition with (from, to).
pub type TransitionObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitBreakerState>>,
    observer: Option<TransitionObserver>,
}

struct CircuitBreakerState {
    current: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open - failing fast")]
    Open,
    #[error("call failed: {0}")]
    CallFailed(E),
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitBreakerState {
                current: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            config,
            observer: None,
        }
    }

    /// Attach a transition observer (used to count breaker trips).
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Execute a future with circuit breaker protection.
    ///
    /// The inner error type is preserved so callers can classify failures
    /// without parsing strings.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.config.enabled {
            return f().await.map_err(CircuitBreakerError::CallFailed);
        }

        // Fast path: check if circuit is open
        if self.should_reject_call() {
            return Err(CircuitBreakerError::Open);
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::CallFailed(e))
            }
        }
    }

    fn should_reject_call(&self) -> bool {
        let mut state = self.state.write();

        match state.current {
            CircuitState::Open => {
                // Check if timeout elapsed, transition to HalfOpen
                if let Some(opened_at) = state.opened_at {
                    if opened_at.elapsed() >= self.config.timeout {
                        self.transition(&mut state, CircuitState::HalfOpen);
                        state.success_count = 0;
                        state.failure_count = 0;
                        false
                    } else {
                        true // Still open, reject
                    }
                } else {
                    true
                }
            }
            CircuitState::HalfOpen | CircuitState::Closed => false,
        }
    }

    fn record_success(&self) {
        let mut state = self.state.write();

        match state.current {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.write();

        match state.current {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = state.failure_count,
                        "Circuit breaker: Closed → Open"
                    );
                    self.transition(&mut state, CircuitState::Open);
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker: HalfOpen → Open (probe failed)");
                self.transition(&mut state, CircuitState::Open);
                state.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.current;
        if from == to {
            return;
        }
        state.current = to;
        info!(from = %from, to = %to, "Circuit breaker state change");
        if let Some(observer) = &self.observer {
            observer(from, to);
        }
    }

    /// Get current circuit state (for monitoring)
    pub fn state(&self) -> CircuitState {
        self.state.read().current
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Force the breaker back to Closed and clear all counters.
    pub fn reset(&self) {
        let mut state = self.state.write();
        if state.current != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            timeout,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn opens_exactly_at_the_failure_threshold() {
        let cb = CircuitBreaker::new(config(3, 2, Duration::from_secs(60)));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
            assert_eq!(cb.state(), CircuitState::Closed, "opened before threshold");
        }

        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Next call fails fast without invoking the closure.
        let result = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn closed_success_decrements_failure_count() {
        let cb = CircuitBreaker::new(config(3, 2, Duration::from_secs(60)));

        // Two failures, then a success that pays one back: the next two
        // failures must not trip the breaker, the one after must.
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;

        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_to_halfopen_after_timeout() {
        let cb = CircuitBreaker::new(config(2, 2, Duration::from_millis(100)));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        // Next call is admitted as a probe.
        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn halfopen_closes_after_success_threshold() {
        let cb = CircuitBreaker::new(config(2, 2, Duration::from_millis(100)));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        for _ in 0..2 {
            let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn halfopen_failure_reopens_and_resets_timer() {
        let cb = CircuitBreaker::new(config(2, 2, Duration::from_millis(100)));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Freshly reopened: still rejecting right away.
        let result = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn disabled_breaker_is_a_pass_through() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            enabled: false,
            ..Default::default()
        });

        for _ in 0..5 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        let result = cb.call(|| async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn reset_closes_an_open_breaker() {
        let cb = CircuitBreaker::new(config(1, 2, Duration::from_secs(60)));

        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);

        let result = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn observer_sees_every_transition() {
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&transitions);

        let cb = CircuitBreaker::new(config(1, 1, Duration::from_millis(50)))
            .with_observer(Arc::new(move |_from, _to| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        // Closed → Open
        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        // Open → HalfOpen → Closed
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;

        assert_eq!(transitions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_calls_do_not_count_as_failures() {
        let cb = CircuitBreaker::new(config(2, 1, Duration::from_millis(100)));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Rejected while open: no state change, closure never runs.
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = cb
            .call(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Recovery still works afterwards.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
