/// Retry delay arithmetic: exponential backoff with optional jitter
///
/// delay(n) = clamp(initial_delay * multiplier^(n-1) ± jitter, 0, max_delay)
/// with jitter drawn uniformly from ±(jitter_ratio * delay) when enabled.
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt for exponential backoff
    pub multiplier: f64,
    /// Add random jitter to each delay
    pub jitter: bool,
    /// Jitter amplitude as a fraction of the computed delay (0.0 - 1.0)
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the n-th failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exponent = (attempt - 1).min(32);
        let delay_ms = (base_ms * self.multiplier.powi(exponent as i32)).min(max_ms);

        let jittered_ms = if self.jitter && self.jitter_ratio > 0.0 {
            let amplitude = self.jitter_ratio.clamp(0.0, 1.0) * delay_ms;
            let offset = rand::thread_rng().gen_range(-amplitude..=amplitude);
            delay_ms + offset
        } else {
            delay_ms
        };

        Duration::from_millis(jittered_ms.clamp(0.0, max_ms) as u64)
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}
