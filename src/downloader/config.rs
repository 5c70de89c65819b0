//! Download configuration constants and retry policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Flush interval for sinks (flush every N records)
pub const FLUSH_INTERVAL: u64 = 1_000;

/// Interval between `[PROGRESS]` log lines
pub const PROGRESS_LOG_INTERVAL_MS: u64 = 10_000;

/// Configuration errors, raised synchronously before any work starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field has a value outside its valid range
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub fn millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Whole milliseconds in `duration` as a timestamp offset, saturating at `i64::MAX`
pub fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Calculate exponential backoff delay with the default bounds
pub fn calculate_backoff(retry_count: u32) -> Duration {
    RetryPolicy::default().backoff(retry_count)
}

/// Retry behaviour for transient transport failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First backoff delay
    pub initial_backoff_ms: u64,
    /// Upper bound for any single backoff
    pub max_backoff_ms: u64,
    /// Give up after this many consecutive failures; `None` retries indefinitely
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries at most `max_retries` times
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the backoff bounds
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = millis_u64(initial);
        self.max_backoff_ms = millis_u64(max);
        self
    }

    /// Backoff before retry number `retry_count` (0-based), capped at the maximum
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        let delay_ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_retries.map_or(true, |max| failures <= max)
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "max_backoff_ms",
                format!(
                    "must be >= initial_backoff_ms ({} < {})",
                    self.max_backoff_ms, self.initial_backoff_ms
                ),
            ));
        }
        Ok(())
    }
}
