//! Exponential backoff between automatic reconnection attempts.
//!
//! When an established connection drops, the driver does not hammer the broker
//! with immediate retries. It waits for a delay that grows with every failed
//! attempt and resets once a CONNACK is received again:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With the defaults (initial=1s, multiplier=1.5, max=30s) the schedule is
//! 1s, 1.5s, 2.25s, ... and then 30s until the attempt limit is reached.
//!
//! ```ignore
//! let mut backoff = Backoff::default();
//! let first = backoff.next_sleep()?;   // 1s
//! let second = backoff.next_sleep()?;  // 1.5s
//! backoff.reset();                     // back to 1s after a successful reconnect
//! ```

use std::time::Duration;

use thiserror::Error;

use super::config::ReconnectConfig;

/// Raised when the reconnect schedule is exhausted.
#[derive(Debug, Error)]
pub enum BackoffError {
    /// More attempts were requested than the configured (or derived) limit.
    #[error("Maximum number of reconnect attempts exceeded: {0}")]
    AttemptsExhausted(u32),
}

/// Reconnect delay controller owned by a single connection driver.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay returned by the first attempt after a reset.
    initial_delay: Duration,

    /// Delay the next call to `next_sleep` will return.
    current_delay: Duration,

    /// Upper bound for any single delay.
    max_delay: Duration,

    /// Growth factor applied after every attempt.
    multiplier: f64,

    /// Attempts made since the last reset.
    attempt: u32,

    /// Explicit attempt limit; falls back to `calculated_max_attempts` when unset.
    max_attempts: Option<u32>,

    /// Number of attempts needed to reach `max_delay`, derived from the timing parameters.
    calculated_max_attempts: u32,
}

impl Backoff {
    /// Creates a controller with custom timing.
    ///
    /// A `multiplier <= 1.0` or `initial >= max` cannot grow, so the derived
    /// attempt limit collapses to one.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier,
            attempt: 0,
            max_attempts: None,
            calculated_max_attempts: Self::calculate_max_attempts(initial, max, multiplier),
        }
    }

    /// Builds the controller described by the `[network.reconnect]` section.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        let mut backoff = Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        );
        if let Some(max) = config.max_attempts {
            backoff.set_max_attempts(max);
        }
        backoff
    }

    // initial * multiplier^n = max  =>  n = log(max / initial) / log(multiplier)
    fn calculate_max_attempts(initial: Duration, max: Duration, multiplier: f64) -> u32 {
        if initial >= max || multiplier <= 1.0 || initial.is_zero() {
            return 1;
        }

        let n = (max.as_secs_f64() / initial.as_secs_f64()).log(multiplier);
        n.floor() as u32 + 1
    }

    /// Overrides the derived attempt limit.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Starts the schedule over. Called whenever a connection is re-established.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay before the next attempt and advances the schedule.
    ///
    /// # Errors
    /// `BackoffError::AttemptsExhausted` once the attempt limit is passed.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt += 1;
        let limit = self.max_attempts.unwrap_or(self.calculated_max_attempts);

        if self.attempt > limit {
            return Err(BackoffError::AttemptsExhausted(limit));
        }

        let sleep = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        Ok(sleep)
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound for a single delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Attempt limit derived from the timing parameters.
    pub fn calculated_max_attempts(&self) -> u32 {
        self.calculated_max_attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
