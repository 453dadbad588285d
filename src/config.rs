//! Limiter configuration.

use crate::error::ConfigError;
use std::time::Duration;

/// Delay requests once a bucket reaches this fraction of its capacity.
pub const DEFAULT_TARGET_FRACTION: f64 = 0.75;
/// Tokens claimed per scheduled request before the server's count is known.
pub const DEFAULT_ESTIMATED_TOKENS_PER_REQUEST: u32 = 5;
/// Upper bound on a single wait inside the delay loop.
pub const DEFAULT_MAX_WAIT_PER_ATTEMPT: Duration = Duration::from_secs(10);

/// Validated configuration for [`MemoryRateLimiter`](crate::MemoryRateLimiter).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct RateLimiterConfig {
    /// Utilization in (0, 1] at or above which requests are delayed.
    pub target_fraction: f64,
    /// Eager claim per request. Zero disables eager claiming.
    pub estimated_tokens_per_request: u32,
    /// Longest single wait; the bucket is re-read after each.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub max_wait_per_attempt: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            target_fraction: DEFAULT_TARGET_FRACTION,
            estimated_tokens_per_request: DEFAULT_ESTIMATED_TOKENS_PER_REQUEST,
            max_wait_per_attempt: DEFAULT_MAX_WAIT_PER_ATTEMPT,
        }
    }
}

impl RateLimiterConfig {
    /// Create a config with validation.
    pub fn new(
        target_fraction: f64,
        estimated_tokens_per_request: u32,
        max_wait_per_attempt: Duration,
    ) -> Result<Self, ConfigError> {
        let cfg = Self { target_fraction, estimated_tokens_per_request, max_wait_per_attempt };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.target_fraction;
        if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
            return Err(ConfigError::InvalidTargetFraction(fraction));
        }
        if self.max_wait_per_attempt.is_zero() {
            return Err(ConfigError::InvalidMaxWait(self.max_wait_per_attempt));
        }
        Ok(())
    }
}
