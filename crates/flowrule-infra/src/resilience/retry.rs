//! Retry policies
//!
//! Bounded retry with exponential backoff and jitter. Attempts are counted
//! from 1; the first call is attempt 1 and never waits.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Whether to add random jitter
    pub jitter: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Exponential backoff between `initial` and `max`, `max_attempts` calls in total.
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self::new(
            RetryConfig::new(max_attempts)
                .with_initial_delay(initial)
                .with_max_delay(max),
        )
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay to wait before `attempt` (1-indexed). Attempt 1 never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2) as i32;
        let base_delay = self
            .config
            .initial_delay
            .mul_f64(self.config.multiplier.powi(exponent));
        let delay = base_delay.min(self.config.max_delay);

        if self.config.jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let jitter_range = delay.mul_f64(self.config.jitter_factor);
        if jitter_range.is_zero() {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(Duration::ZERO..jitter_range);
        if rng.gen_bool(0.5) {
            (delay + jitter).min(self.config.max_delay)
        } else {
            delay.saturating_sub(jitter)
        }
    }

    /// Whether another attempt may follow `attempt`.
    pub fn has_attempt_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or the
/// policy runs out of attempts. The operation receives the attempt number.
pub async fn retry_with<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !policy.has_attempt_after(attempt) || !should_retry(&e) {
                    return Err(e);
                }

                attempt += 1;
                let delay = policy.delay_before(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying operation");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
