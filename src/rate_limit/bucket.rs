//! Per-(group, owner) token consumption with lazy linear decay.

use crate::clock::Clock;
use crate::rate_limit::group::{Group, Limits};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct BucketState {
    consumed: u64,
    last_activity_millis: u64,
}

/// Tokens consumed against one group by one owner.
///
/// Nothing ticks in the background: decay is recomputed from the clock on every read, so
/// consumed tokens fall by `capacity` per `window` of idle time, continuously.
#[derive(Debug)]
pub struct Bucket {
    group: Arc<Group>,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// An empty bucket whose last activity is now.
    pub fn new(group: Arc<Group>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self::with_state(group, clock, 0, now)
    }

    /// A bucket with explicit state, e.g. restored from a snapshot.
    pub fn with_state(
        group: Arc<Group>,
        clock: Arc<dyn Clock>,
        consumed: u64,
        last_activity_millis: u64,
    ) -> Self {
        Self { group, clock, state: Mutex::new(BucketState { consumed, last_activity_millis }) }
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw consumed count, without decay.
    pub fn consumed(&self) -> u64 {
        self.lock().consumed
    }

    pub fn last_activity_millis(&self) -> u64 {
        self.lock().last_activity_millis
    }

    /// Time since the last claim or correction.
    pub fn idle(&self) -> Duration {
        let last = self.last_activity_millis();
        Duration::from_millis(self.clock.now_millis().saturating_sub(last))
    }

    /// Consumed tokens after decay, never negative.
    pub fn effective_tokens(&self) -> u64 {
        let state = *self.lock();
        let elapsed = self.clock.now_millis().saturating_sub(state.last_activity_millis);
        decayed(state.consumed, elapsed, self.group.limits())
    }

    /// Effective tokens as a fraction of capacity. May exceed 1.0 under heavy eager claiming.
    pub fn current_usage(&self) -> f64 {
        self.effective_tokens() as f64 / f64::from(self.group.capacity())
    }

    /// How long decay alone needs to bring usage down to `target` tokens.
    pub fn time_until(&self, target: u64) -> Duration {
        let missing = self.effective_tokens().saturating_sub(target);
        if missing == 0 {
            return Duration::ZERO;
        }
        let per_token = self.group.time_per_token();
        per_token.checked_mul(u32::try_from(missing).unwrap_or(u32::MAX)).unwrap_or(Duration::MAX)
    }

    /// Overwrite the local estimate with the server's remaining count.
    ///
    /// Returns the new consumed count. A remaining count above capacity clamps it to zero; a
    /// negative one (overdrawn quota) pushes it above capacity.
    pub fn set_remaining_tokens(&self, remaining: i64) -> u64 {
        let capacity = u64::from(self.group.capacity());
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let consumed = (i128::from(capacity) - i128::from(remaining)).max(0);
        state.consumed = u64::try_from(consumed).unwrap_or(u64::MAX);
        state.last_activity_millis = state.last_activity_millis.max(now);
        state.consumed
    }

    /// Optimistically reserve `tokens` before the response is known.
    ///
    /// Adds to the raw count and restarts decay from now. Returns the new consumed count.
    pub fn claim(&self, tokens: u64) -> u64 {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        state.consumed = state.consumed.saturating_add(tokens);
        state.last_activity_millis = state.last_activity_millis.max(now);
        state.consumed
    }
}

/// `max(0, consumed - floor(capacity * elapsed / window))`.
fn decayed(consumed: u64, elapsed_millis: u64, limits: Limits) -> u64 {
    let window_nanos = limits.window().as_nanos().max(1);
    let recovered =
        u128::from(limits.capacity()) * u128::from(elapsed_millis) * 1_000_000 / window_nanos;
    let recovered = u64::try_from(recovered).unwrap_or(u64::MAX);
    consumed.saturating_sub(recovered)
}
