//! Connection pool configuration.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use intel_feed::{BackoffSchedule, PoolConfig};
//!
//! let config = PoolConfig::new()
//!     .with_max_connections(2)
//!     .with_max_reconnect_attempts(3)
//!     .with_backoff(BackoffSchedule::exponential(Duration::from_millis(500), 4))
//!     .with_linger(Duration::from_secs(2));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.backoff.delay_for(10), Duration::from_secs(4));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on concurrently pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 3;

/// Default number of retries before a connection is abandoned.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default timeout for one connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-connection message channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// BackoffSchedule
// ============================================================================

/// Ordered reconnect delays.
///
/// Attempt `n` waits `steps[min(n, len - 1)]`, so the last step repeats once
/// the schedule is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl BackoffSchedule {
    /// Creates a schedule from explicit steps.
    #[inline]
    #[must_use]
    pub fn new(steps: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    /// Creates `count` doubling steps starting at `base`.
    #[must_use]
    pub fn exponential(base: Duration, count: u32) -> Self {
        Self::new((0..count).map(|i| base.saturating_mul(1 << i.min(31))))
    }

    /// Returns the delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let last = self.steps.len().saturating_sub(1);
        let index = (attempt as usize).min(last);
        self.steps.get(index).copied().unwrap_or_default()
    }

    /// Returns the longest delay.
    #[inline]
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.steps.last().copied().unwrap_or_default()
    }

    /// Returns the configured steps.
    #[inline]
    #[must_use]
    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }

    /// Validates the schedule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the schedule is empty or ever decreases.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::config("Backoff schedule must have at least one step"));
        }
        if self.steps.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(Error::config("Backoff schedule must be non-decreasing"));
        }
        Ok(())
    }
}

impl Default for BackoffSchedule {
    /// 1s, 2s, 4s, 8s, 16s.
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), 5)
    }
}

// ============================================================================
// PoolConfig
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on pooled connections.
    pub max_connections: usize,

    /// Delays between reconnect attempts.
    pub backoff: BackoffSchedule,

    /// Retries allowed after a failure before the connection is abandoned.
    pub max_reconnect_attempts: u32,

    /// How long an unreferenced connection stays pooled. Zero closes it on
    /// the last release.
    pub linger: Duration,

    /// Timeout for one connect attempt.
    pub connect_timeout: Duration,

    /// Per-connection message channel capacity. Slow consumers that fall
    /// further behind lose the oldest messages.
    pub channel_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PoolConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backoff: BackoffSchedule::default(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            linger: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Sets the connection bound.
    #[inline]
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets the backoff schedule.
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the retry budget.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the linger period for unreferenced connections.
    #[inline]
    #[must_use]
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Sets the per-attempt connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the message channel capacity.
    #[inline]
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::config("channel_capacity must be at least 1"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be greater than zero"));
        }
        self.backoff.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_default_schedule() {
        let schedule = BackoffSchedule::default();
        let secs: Vec<u64> = schedule.steps().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16]);
        assert_eq!(schedule.max_delay(), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_caps_at_last_step() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.delay_for(0), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(4), Duration::from_secs(16));
        assert_eq!(schedule.delay_for(40), Duration::from_secs(16));
    }

    #[test]
    fn test_schedule_validation() {
        assert!(BackoffSchedule::new([]).validate().is_err());
        assert!(
            BackoffSchedule::new([Duration::from_secs(2), Duration::from_secs(1)])
                .validate()
                .is_err()
        );
        assert!(
            BackoffSchedule::new([Duration::from_secs(1), Duration::from_secs(1)])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::new();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.linger.is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_zero_connections() {
        let err = PoolConfig::new().with_max_connections(0).validate().unwrap_err();
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_pool_config_rejects_zero_channel() {
        assert!(PoolConfig::new().with_channel_capacity(0).validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_exponential_delays_non_decreasing_and_bounded(
            base_ms in 1u64..5_000,
            count in 1u32..12,
            attempts in 1u32..64,
        ) {
            let schedule = BackoffSchedule::exponential(Duration::from_millis(base_ms), count);
            prop_assert!(schedule.validate().is_ok());

            let delays: Vec<Duration> = (0..attempts).map(|a| schedule.delay_for(a)).collect();
            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            for delay in &delays {
                prop_assert!(*delay <= schedule.max_delay());
            }
            prop_assert_eq!(delays[0], Duration::from_millis(base_ms));
        }
    }
}
