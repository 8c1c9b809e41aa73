//! Backoff policy for rate-limited (HTTP 429) requests.

use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// Configuration for retrying rate-limited requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry when the server gives no `Retry-After`.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, including server-supplied ones.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    /// Random spread as a fraction of the delay (0.25 = ±25%). Zero disables.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 2000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after failed attempt number `attempt` (0-based).
    ///
    /// A server-provided `retry_after` is used as-is, clamped to
    /// `max_delay_ms`. Otherwise `initial_delay_ms * backoff_factor^attempt`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        if let Some(server_delay) = retry_after {
            return server_delay.min(max);
        }

        let base = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let mut delay = base.min(self.max_delay_ms as f64);

        if self.jitter > 0.0 {
            let spread = self.jitter.min(1.0);
            delay *= rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        }

        Duration::from_millis(delay as u64).min(max)
    }
}

/// Parse the `Retry-After` header as (possibly fractional) seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        // Past what a Duration holds; delay_for clamps it to max_delay_ms.
        .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}
