//! Rate limiting primitives.
//!
//! This module provides the building blocks for header-driven admission control:
//! - [`RateLimiter`]: The core trait; `schedule` delays a call until its bucket has headroom.
//! - [`Completion`]: Returned by `schedule`; feeds the response back into the model.
//! - [`RateLimitLayer`]: Tower middleware that schedules every request it sees.
//!
//! # Architecture
//!
//! - **Groups** ([`Group`]) are quota classes the server names in `X-Ratelimit-Group` and sizes
//!   in `X-Ratelimit-Limit`. They are discovered from responses, never configured up front.
//! - **Buckets** ([`Bucket`]) track tokens consumed per (group, owner) and decay lazily.
//! - **Memory limiter** ([`MemoryRateLimiter`]) owns the group, path and bucket tables, runs
//!   the delay loop, and corrects buckets from `X-Ratelimit-Remaining`.
//! - **Middleware** ([`RateLimitLayer`]) wires the limiter into any `http` tower stack.

use crate::context::WaitContext;
use crate::error::ScheduleError;
use crate::request::{Owner, RequestDescriptor};
use std::fmt;

pub mod bucket;
pub mod cleanup;
pub mod group;
pub mod headers;
pub mod memory;
pub mod middleware;

pub use bucket::Bucket;
pub use cleanup::CleanupTask;
pub use group::{Group, GroupInfo, Limits};
pub use headers::{QuotaHeaders, QuotaReport, GROUP_HEADER, LIMIT_HEADER, REMAINING_HEADER};
pub use memory::{BucketInfo, MemoryRateLimiter, MemoryRateLimiterBuilder};
pub use middleware::{RateLimitLayer, RateLimitService};

type OnComplete = Box<dyn FnOnce(Option<&dyn QuotaHeaders>) + Send>;

/// Completion handle for one scheduled call.
///
/// Consume it exactly once: [`complete`](Completion::complete) with the response, or
/// [`abandon`](Completion::abandon) when the transport failed. Dropping it abandons.
#[must_use = "pass the response to `complete` so the limiter can correct its model"]
pub struct Completion {
    on_complete: Option<OnComplete>,
}

impl Completion {
    pub fn new<F>(on_complete: F) -> Self
    where
        F: FnOnce(Option<&dyn QuotaHeaders>) + Send + 'static,
    {
        Self { on_complete: Some(Box::new(on_complete)) }
    }

    /// A completion with nothing to correct.
    pub fn noop() -> Self {
        Self { on_complete: None }
    }

    /// Report the response headers of the finished call.
    pub fn complete<H: QuotaHeaders>(mut self, headers: &H) {
        if let Some(f) = self.on_complete.take() {
            f(Some(headers as &dyn QuotaHeaders));
        }
    }

    /// The call produced no response; leave the model as is.
    pub fn abandon(mut self) {
        self.finish_empty();
    }

    fn finish_empty(&mut self) {
        if let Some(f) = self.on_complete.take() {
            f(None);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish_empty();
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("pending", &self.on_complete.is_some()).finish()
    }
}

/// Core interface for outbound admission control.
///
/// This trait decouples the middleware from the model that decides how long to wait.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until `descriptor` may be sent on behalf of `owner`.
    ///
    /// # Errors
    /// Returns [`ScheduleError`] if `ctx` is cancelled or its deadline passes first. The caller
    /// must not send the request in that case.
    async fn schedule(
        &self,
        ctx: &WaitContext,
        descriptor: &RequestDescriptor,
        owner: Owner,
    ) -> Result<Completion, ScheduleError>;
}

#[async_trait::async_trait]
impl<L> RateLimiter for std::sync::Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn schedule(
        &self,
        ctx: &WaitContext,
        descriptor: &RequestDescriptor,
        owner: Owner,
    ) -> Result<Completion, ScheduleError> {
        (**self).schedule(ctx, descriptor, owner).await
    }
}
