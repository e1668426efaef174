//! Reconnection Policy
//!
//! Exponential backoff with jitter between reconnection attempts after an
//! abnormal socket loss. A policy instance covers one reconnection episode:
//! it is created when the socket drops and discarded once a session is
//! re-established or the attempts are exhausted.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::TransportSettings;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor applied after each attempt.
    pub multiplier: f64,
    /// Randomization as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `TransportSettings`.
    #[must_use]
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            max_attempts: settings.max_reconnect_attempts,
            ..Self::default()
        }
    }

    /// Check if attempts are unbounded.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }
}

/// Error returned once the policy gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// All allowed attempts were used.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    Exhausted(u32),
}

/// Backoff state for one reconnection episode.
///
/// # Example
///
/// ```rust
/// use graphql_ws_transport::infrastructure::graphql_ws::reconnect::{
///     ReconnectConfig, ReconnectPolicy,
/// };
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     jitter_factor: 0.0,
///     max_attempts: 2,
///     ..ReconnectConfig::default()
/// });
///
/// assert_eq!(policy.next_delay(), Ok(Duration::from_millis(500)));
/// assert_eq!(policy.next_delay(), Ok(Duration::from_millis(1000)));
/// assert!(policy.next_delay().is_err());
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt.
    ///
    /// # Errors
    ///
    /// Returns `ReconnectError::Exhausted` once `max_attempts` delays have
    /// been handed out.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        if !self.should_retry() {
            return Err(ReconnectError::Exhausted(self.attempts));
        }

        self.attempts += 1;
        let delay = self.jittered(self.current_delay);
        self.current_delay = self.grown(self.current_delay);

        Ok(delay)
    }

    /// Number of attempts handed out so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.is_unlimited() || self.attempts < self.config.max_attempts
    }

    /// Next base delay: scaled by the multiplier, capped at `max_delay`.
    fn grown(&self, delay: Duration) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let scaled = (delay.as_millis() as f64 * self.config.multiplier).round();
        if !scaled.is_finite() || scaled <= 0.0 {
            return Duration::ZERO;
        }

        let max_millis = self.config.max_delay.as_millis();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (scaled as u128).min(max_millis);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let base = delay.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);

        Duration::try_from_secs_f64((base + offset).max(0.001)).unwrap_or(delay)
    }
}
