/// Resilience patterns for the outbox relay
///
/// This library provides the reliability primitives wrapped around the
/// broker publisher:
/// - **Circuit Breaker**: fails fast while the broker is unhealthy and
///   probes it again after a cool-down
/// - **Retry arithmetic**: exponential backoff with optional jitter, shared
///   by the batch processor's inner retry loop
///
/// # Example: publish call with circuit breaker
///
/// ```rust,no_run
/// use resilience::{CircuitBreaker, CircuitBreakerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         // Your broker publish here
///         Ok::<_, String>(())
///     }).await;
/// }
/// ```
pub mod circuit_breaker;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::RetryPolicy;
