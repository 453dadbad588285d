//! Periodic removal of idle buckets.

use crate::rate_limit::memory::{MemoryRateLimiter, Shared};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a background sweep started by [`MemoryRateLimiter::spawn_cleanup`].
///
/// The sweep stops when the handle is dropped, when [`stop`](CleanupTask::stop) is called, or
/// when every clone of the limiter is gone.
#[derive(Debug)]
pub struct CleanupTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Signal the sweep to stop without waiting for it.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            // A panicked sweep has nothing left to clean up.
            let _ = handle.await;
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl MemoryRateLimiter {
    /// Run [`cleanup_expired_buckets`](MemoryRateLimiter::cleanup_expired_buckets) every
    /// `every` on the current tokio runtime.
    ///
    /// The task only holds a weak reference, so it never keeps the limiter alive.
    ///
    /// # Panics
    /// Panics if `every` is zero or if called outside a tokio runtime.
    pub fn spawn_cleanup(&self, every: Duration) -> CleanupTask {
        assert!(!every.is_zero(), "cleanup interval must be non-zero");
        let token = CancellationToken::new();
        let weak = std::sync::Arc::downgrade(&self.shared);
        let handle = tokio::spawn(sweep(weak, every, token.clone()));
        CleanupTask { token, handle: Some(handle) }
    }
}

async fn sweep(shared: Weak<Shared>, every: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing can have expired yet.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.cleanup_expired();
    }
    debug!("rate limit cleanup task stopped");
}
