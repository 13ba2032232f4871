//! Retry ceiling and exponential backoff schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// How often and how patiently a provisioning operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always >= 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Partial policy as written in settings or case files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub base_delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
}

impl RetryOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl RetryPolicy {
    /// Delay to wait after `retries_so_far` retries have already happened.
    ///
    /// `base * 2^retries_so_far`, capped at `max_delay`.
    pub fn delay_for(&self, retries_so_far: u32) -> Duration {
        let factor = 2u32.checked_pow(retries_so_far).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Return a copy with every `Some` field of `overrides` applied.
    pub fn with_overrides(mut self, overrides: &RetryOverrides) -> Self {
        if let Some(max_attempts) = overrides.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(secs) = overrides.base_delay_secs {
            self.base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.max_delay_secs {
            self.max_delay = Duration::from_secs(secs);
        }
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("retry.max_delay_secs must be >= retry.base_delay_secs".to_string());
        }
        Ok(())
    }
}
