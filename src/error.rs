//! Error types for rate limiting
use std::time::Duration;

/// A malformed `X-Ratelimit-Group` / `X-Ratelimit-Limit` pair.
///
/// Never surfaced to callers of `schedule`: the limiter logs it and keeps its current model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidHeader {
    /// The group name was empty.
    #[error("invalid header: empty rate-limit group name")]
    EmptyName,
    /// The limit value was empty.
    #[error("invalid header: empty rate-limit limit")]
    EmptyLimit,
    /// The limit did not split into exactly `<capacity>/<window>`.
    #[error("invalid header: limit `{0}` is not of the form <capacity>/<window>")]
    Malformed(String),
    /// Capacity was not a positive integer.
    #[error("invalid header: capacity `{0}` is not a positive integer")]
    Capacity(String),
    /// Window was not a positive duration.
    #[error("invalid header: window `{0}` is not a positive duration")]
    Window(String),
}

/// Errors returned by `schedule`. The caller must not send the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The wait context was cancelled.
    #[error("rate limit wait cancelled")]
    Cancelled,
    /// The wait context's deadline passed.
    #[error("rate limit wait exceeded its deadline")]
    DeadlineExceeded,
}

impl ScheduleError {
    /// Check if this error is due to explicit cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error is due to the deadline passing
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

/// Errors produced when validating limiter configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Target fraction must be finite and in (0, 1].
    #[error("target_fraction must be in (0, 1] (got {0})")]
    InvalidTargetFraction(f64),
    /// Per-attempt wait must be > 0.
    #[error("max_wait_per_attempt must be > 0 (got {0:?})")]
    InvalidMaxWait(Duration),
}

/// Error returned by [`RateLimitService`](crate::rate_limit::RateLimitService).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError<E> {
    /// Scheduling failed; the inner service was never called.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    /// The wrapped service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> ServiceError<E> {
    /// Check if scheduling (not the inner service) failed
    pub fn is_schedule(&self) -> bool {
        matches!(self, Self::Schedule(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
