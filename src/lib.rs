#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Headroom
//!
//! Client-side admission control for HTTP APIs that publish their quotas in response headers.
//!
//! The server names a quota group per endpoint (`X-Ratelimit-Group`), sizes it
//! (`X-Ratelimit-Limit: 150/15m`) and reports what is left (`X-Ratelimit-Remaining`).
//! Headroom learns those groups from responses, keeps a decaying token estimate per
//! (group, owner), and delays outgoing calls until usage drops below a target fraction of
//! capacity, so the server never has to reject them.
//!
//! ## Features
//!
//! - **Header-driven discovery**: no quota configuration up front
//! - **Lazy linear decay**: nothing ticks in the background
//! - **Eager claims** so concurrent callers see each other's usage before responses arrive
//! - **Cancellable waits** via [`WaitContext`] (token plus deadline)
//! - **Tower middleware** for `http` client stacks
//!
//! ## Quick Start
//!
//! ```rust
//! use headroom::{MemoryRateLimiter, Owner, RateLimiter, RequestDescriptor, WaitContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), headroom::ScheduleError> {
//!     let limiter = MemoryRateLimiter::new();
//!     let _cleanup = limiter.spawn_cleanup(Duration::from_secs(60));
//!
//!     let descriptor = RequestDescriptor::new(http::Method::GET, "/characters/{character_id}/");
//!     let ctx = WaitContext::new().with_timeout(Duration::from_secs(30));
//!
//!     let completion = limiter.schedule(&ctx, &descriptor, Owner::Anonymous).await?;
//!     // Send the request, then hand the response headers back.
//!     let response = http::Response::new(());
//!     completion.complete(&response);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod request;
pub mod sleeper;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::RateLimiterConfig;
pub use context::WaitContext;
pub use error::{ConfigError, InvalidHeader, ScheduleError, ServiceError};
pub use rate_limit::{
    BucketInfo, CleanupTask, Completion, GroupInfo, Limits, MemoryRateLimiter,
    MemoryRateLimiterBuilder, QuotaHeaders, QuotaReport, RateLimitLayer, RateLimitService,
    RateLimiter,
};
pub use request::{BoundOwner, Owner, RequestDescriptor};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
