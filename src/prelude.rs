//! Convenient re-exports for common Headroom types.
pub use crate::{
    context::WaitContext,
    error::{ScheduleError, ServiceError},
    rate_limit::{Completion, MemoryRateLimiter, RateLimitLayer, RateLimiter},
    request::{Owner, RequestDescriptor},
    RateLimiterConfig,
};
