//! Reconnection Policy
//!
//! Jittered exponential backoff for the streaming connection. For the
//! 0-based consecutive-failure counter `n`:
//!
//! ```text
//! wait(n) = unit * (r * min(max_backoff / unit, 2^n - 1) + 1),   r ~ U[0, 1]
//! ```
//!
//! so every wait lies in `[unit, unit * (min(max_backoff / unit, 2^n - 1) + 1)]`.
//! The counter resets on every successful connect; once `max_reconnects`
//! retries have been scheduled without success the policy is exhausted.

use std::time::Duration;

use rand::Rng;

/// Default cap on the exponential term.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Default number of consecutive retries before giving up.
pub const DEFAULT_MAX_RECONNECTS: u32 = 5;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Cap on the exponential term of the wait.
    pub max_backoff: Duration,
    /// Time unit the formula is expressed in.
    pub unit: Duration,
    /// Consecutive retries allowed before the connection exits.
    pub max_reconnects: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_backoff: DEFAULT_MAX_BACKOFF,
            unit: Duration::from_secs(1),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(max_backoff: Duration, unit: Duration, max_reconnects: u32) -> Self {
        Self {
            max_backoff,
            unit,
            max_reconnects,
        }
    }

    /// Upper bound of the wait for `attempt`, in units.
    #[must_use]
    pub fn upper_bound_units(&self, attempt: u32) -> f64 {
        self.exponential_term(attempt) + 1.0
    }

    fn exponential_term(&self, attempt: u32) -> f64 {
        let unit = nanos(self.unit);
        let cap = if unit > 0.0 {
            nanos(self.max_backoff) / unit
        } else {
            0.0
        };
        let exp = f64::from(attempt.min(1023)).exp2() - 1.0;
        cap.min(exp)
    }
}

#[allow(clippy::cast_precision_loss)]
const MAX_NANOS: f64 = u64::MAX as f64;

#[allow(clippy::cast_precision_loss)]
fn nanos(duration: Duration) -> f64 {
    duration.as_nanos() as f64
}

/// Reconnection policy implementing jittered exponential backoff.
///
/// # Example
///
/// ```rust
/// use orderly_stream_client::infrastructure::orderly::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// // The first retry always waits exactly one unit
/// let delay = policy.next_delay().unwrap();
/// assert_eq!(delay.as_secs(), 1);
///
/// // Simulate successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Get the wait before the next retry and count the retry.
    ///
    /// Returns `None` once `max_reconnects` retries have been scheduled.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let r: f64 = rand::rng().random_range(0.0..=1.0);
        let delay = self.wait_with(self.attempt_count, r);
        self.attempt_count += 1;
        Some(delay)
    }

    /// Deterministic form of the wait for `attempt` with jitter sample `r`.
    #[must_use]
    pub fn wait_with(&self, attempt: u32, r: f64) -> Duration {
        let r = r.clamp(0.0, 1.0);
        let units = r.mul_add(self.config.exponential_term(attempt), 1.0);
        let total = (nanos(self.config.unit) * units).round();
        if total.is_finite() && total < MAX_NANOS {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                Duration::from_nanos(total as u64)
            }
        } else {
            self.config.max_backoff + self.config.unit
        }
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the number of retries scheduled since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempt_count < self.config.max_reconnects
    }
}
