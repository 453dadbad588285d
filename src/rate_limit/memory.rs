//! In-process rate limiter keyed by server-advertised quota groups.
//!
//! Semantics:
//! - An endpoint path is bound to a [`Group`] the first time a response names one. Until
//!   then, calls to that path are never delayed.
//! - Buckets are keyed by (group name, [`BoundOwner`]) and created on first use.
//! - `schedule` waits while the bucket is at or above the target fraction, in slices of at most
//!   `max_wait_per_attempt`, re-reading the bucket after each slice. It then claims the
//!   estimated cost of the request.
//! - Responses correct the model: group limits are updated in place by name, the path is
//!   rebound if the server names a different group, and `X-Ratelimit-Remaining` overwrites the
//!   bucket's estimate.
//! - Malformed quota headers are logged and ignored. They never block traffic.
//!
//! Locking: the group, path and bucket tables each sit behind their own `RwLock`; a bucket's
//! counters sit behind the bucket's own mutex. No lock is held across an await.

use crate::clock::{Clock, MonotonicClock};
use crate::config::RateLimiterConfig;
use crate::context::WaitContext;
use crate::error::{ConfigError, ScheduleError};
use crate::rate_limit::bucket::Bucket;
use crate::rate_limit::group::{Group, GroupInfo, Limits};
use crate::rate_limit::headers::{QuotaHeaders, QuotaReport};
use crate::rate_limit::{Completion, RateLimiter};
use crate::request::{BoundOwner, Owner, RequestDescriptor};
use crate::sleeper::{Sleeper, TokioSleeper};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BucketKey {
    group: String,
    owner: BoundOwner,
}

/// Read-only snapshot of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketInfo {
    pub group: String,
    pub owner: BoundOwner,
    pub capacity: u32,
    pub effective_tokens: u64,
    /// Limiter clock reading of the last claim or correction.
    pub last_activity_millis: u64,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub idle: Duration,
}

#[derive(Debug)]
pub(crate) struct Shared {
    config: ArcSwap<RateLimiterConfig>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    paths: RwLock<HashMap<String, Arc<Group>>>,
    buckets: RwLock<HashMap<BucketKey, Arc<Bucket>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn group_for_path(&self, path: &str) -> Option<Arc<Group>> {
        read(&self.paths).get(path).cloned()
    }

    fn bind_path(&self, path: &str, group: &Arc<Group>) {
        let current = self.group_for_path(path);
        if current.as_ref().is_some_and(|c| c.name() == group.name()) {
            return;
        }
        write(&self.paths).insert(path.to_string(), group.clone());
        info!(
            path,
            from = current.as_ref().map(|c| c.name()),
            to = group.name(),
            "endpoint bound to rate limit group"
        );
    }

    /// Find the named group, creating it or correcting its limits in place.
    pub(crate) fn upsert_group(&self, name: &str, limits: Limits) -> Arc<Group> {
        let existing = read(&self.groups).get(name).cloned();
        let group = match existing {
            Some(group) => group,
            None => write(&self.groups)
                .entry(name.to_string())
                .or_insert_with(|| {
                    info!(
                        group = name,
                        capacity = limits.capacity(),
                        window = ?limits.window(),
                        "discovered rate limit group"
                    );
                    Arc::new(Group::new(name, limits))
                })
                .clone(),
        };

        if group.limits() != limits {
            let previous = group.update(limits);
            info!(
                group = name,
                capacity = limits.capacity(),
                window = ?limits.window(),
                previous_capacity = previous.capacity(),
                previous_window = ?previous.window(),
                "rate limit group limits changed"
            );
        }
        group
    }

    pub(crate) fn bucket(&self, group: &Arc<Group>, owner: BoundOwner) -> Arc<Bucket> {
        let key = BucketKey { group: group.name().to_string(), owner };
        if let Some(bucket) = read(&self.buckets).get(&key) {
            return bucket.clone();
        }
        write(&self.buckets)
            .entry(key)
            .or_insert_with(|| Arc::new(Bucket::new(group.clone(), self.clock.clone())))
            .clone()
    }

    fn process_response(&self, path: &str, owner: BoundOwner, headers: &dyn QuotaHeaders) {
        let report = match QuotaReport::from_headers(headers) {
            Ok(Some(report)) => report,
            Ok(None) => return,
            Err(error) => {
                debug!(path, %error, "ignoring malformed rate limit headers");
                return;
            }
        };

        let group = self.upsert_group(&report.group, report.limits);
        self.bind_path(path, &group);

        if let Some(remaining) = report.remaining {
            let consumed = self.bucket(&group, owner).set_remaining_tokens(remaining);
            debug!(group = group.name(), %owner, remaining, consumed, "bucket corrected");
        }
    }

    fn is_expired(&self, bucket: &Bucket, now_millis: u64) -> bool {
        let idle = Duration::from_millis(now_millis.saturating_sub(bucket.last_activity_millis()));
        idle > bucket.group().window().saturating_mul(2)
    }

    /// Keys of buckets idle past two windows at `now_millis`.
    pub(crate) fn expired_keys(&self, now_millis: u64) -> Vec<BucketKey> {
        read(&self.buckets)
            .iter()
            .filter(|(_, bucket)| self.is_expired(bucket, now_millis))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Remove `keys`, skipping any bucket touched since they were collected.
    pub(crate) fn remove_expired(&self, keys: Vec<BucketKey>, now_millis: u64) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let mut buckets = write(&self.buckets);
        let before = buckets.len();
        for key in keys {
            if buckets.get(&key).is_some_and(|bucket| self.is_expired(bucket, now_millis)) {
                buckets.remove(&key);
            }
        }
        let removed = before - buckets.len();
        debug!(removed, remaining = buckets.len(), "expired rate limit buckets removed");
        removed
    }

    pub(crate) fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let expired = self.expired_keys(now);
        self.remove_expired(expired, now)
    }
}

/// In-memory [`RateLimiter`].
///
/// Clones share the same tables, so one limiter can be handed to every task issuing calls.
/// Separate instances share nothing.
///
/// ```
/// use headroom::{MemoryRateLimiter, Owner, RateLimiter, RequestDescriptor, WaitContext};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let limiter = MemoryRateLimiter::new();
/// let descriptor = RequestDescriptor::new(http::Method::GET, "/status/");
///
/// let completion = limiter.schedule(&WaitContext::new(), &descriptor, Owner::Anonymous).await?;
/// // ... send the request ...
/// let response = http::Response::builder()
///     .header("x-ratelimit-group", "status")
///     .header("x-ratelimit-limit", "600/15m")
///     .header("x-ratelimit-remaining", "598")
///     .body(())
///     .unwrap();
/// completion.complete(&response);
///
/// assert_eq!(limiter.group_for_path("/status/").unwrap().capacity, 600);
/// # Ok::<_, headroom::ScheduleError>(())
/// # }).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct MemoryRateLimiter {
    pub(crate) shared: Arc<Shared>,
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRateLimiter {
    /// A limiter with default configuration, the monotonic clock and tokio sleeps.
    pub fn new() -> Self {
        Self::from_parts(
            RateLimiterConfig::default(),
            Arc::new(MonotonicClock::default()),
            Arc::new(TokioSleeper),
        )
    }

    pub fn builder() -> MemoryRateLimiterBuilder {
        MemoryRateLimiterBuilder::new()
    }

    fn from_parts(
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: ArcSwap::from_pointee(config),
                clock,
                sleeper,
                groups: RwLock::default(),
                paths: RwLock::default(),
                buckets: RwLock::default(),
            }),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> RateLimiterConfig {
        **self.shared.config.load()
    }

    /// Swap the configuration at runtime. Existing buckets are kept.
    pub fn set_config(&self, config: RateLimiterConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.shared.config.store(Arc::new(config));
        info!(
            target_fraction = config.target_fraction,
            estimated_tokens_per_request = config.estimated_tokens_per_request,
            max_wait_per_attempt = ?config.max_wait_per_attempt,
            "rate limiter configuration updated"
        );
        Ok(())
    }

    /// Snapshot of every bucket, sorted by group then owner key.
    pub fn buckets(&self) -> Vec<BucketInfo> {
        let now = self.shared.clock.now_millis();
        let entries: Vec<(BucketKey, Arc<Bucket>)> =
            read(&self.shared.buckets).iter().map(|(k, b)| (k.clone(), b.clone())).collect();

        let mut infos: Vec<BucketInfo> = entries
            .into_iter()
            .map(|(key, bucket)| {
                let last_activity_millis = bucket.last_activity_millis();
                BucketInfo {
                    group: key.group,
                    owner: key.owner,
                    capacity: bucket.group().capacity(),
                    effective_tokens: bucket.effective_tokens(),
                    last_activity_millis,
                    idle: Duration::from_millis(now.saturating_sub(last_activity_millis)),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.group.cmp(&b.group).then(a.owner.key().cmp(&b.owner.key())));
        infos
    }

    /// Snapshot of every known group, sorted by name.
    pub fn groups(&self) -> Vec<GroupInfo> {
        let mut infos: Vec<GroupInfo> =
            read(&self.shared.groups).values().map(|g| g.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// The group currently believed to govern `path`, if any response has named one.
    pub fn group_for_path(&self, path: &str) -> Option<GroupInfo> {
        self.shared.group_for_path(path).map(|g| g.info())
    }

    /// Remove buckets idle for more than two windows of their group. Returns how many went.
    ///
    /// Safe to call while requests are being scheduled: a removed bucket had fully decayed and
    /// is recreated empty on next use.
    pub fn cleanup_expired_buckets(&self) -> usize {
        self.shared.cleanup_expired()
    }

    async fn delay(
        &self,
        ctx: &WaitContext,
        bucket: &Bucket,
        config: &RateLimiterConfig,
    ) -> Result<(), ScheduleError> {
        loop {
            ctx.check()?;

            // Limits may have been corrected while we slept.
            let target = bucket.group().target_size(config.target_fraction);
            let wait = bucket.time_until(target);
            if wait.is_zero() {
                return Ok(());
            }

            // Cap each wait so very restrictive groups re-read the model regularly.
            let wait = wait.min(config.max_wait_per_attempt);
            debug!(group = bucket.group().name(), ?wait, "waiting for rate limit headroom");
            ctx.run(self.shared.sleeper.sleep(wait)).await?;
        }
    }
}

#[async_trait::async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn schedule(
        &self,
        ctx: &WaitContext,
        descriptor: &RequestDescriptor,
        owner: Owner,
    ) -> Result<Completion, ScheduleError> {
        let bound = owner.bind(descriptor);
        let config = self.shared.config.load_full();
        let bucket = self
            .shared
            .group_for_path(descriptor.path())
            .map(|group| self.shared.bucket(&group, bound));

        if let Some(bucket) = &bucket {
            if bucket.current_usage() >= config.target_fraction {
                if let Err(error) = self.delay(ctx, bucket, &config).await {
                    debug!(path = descriptor.path(), %bound, %error, "rate limit wait aborted");
                    return Err(error);
                }
            }
        }
        ctx.check()?;

        // Claim on the bucket that was waited on.
        if let Some(bucket) = &bucket {
            let tokens = u64::from(config.estimated_tokens_per_request);
            let consumed = bucket.claim(tokens);
            let group = bucket.group().name();
            debug!(group, owner = %bound, tokens, consumed, "tokens claimed");
        }

        let shared = self.shared.clone();
        let path = descriptor.path().to_string();
        Ok(Completion::new(move |headers| {
            if let Some(headers) = headers {
                shared.process_response(&path, bound, headers);
            }
        }))
    }
}

/// Builder for [`MemoryRateLimiter`].
#[derive(Debug)]
pub struct MemoryRateLimiterBuilder {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for MemoryRateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRateLimiterBuilder {
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self {
            config: RateLimiterConfig::default(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RateLimiterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn target_fraction(mut self, fraction: f64) -> Self {
        self.config.target_fraction = fraction;
        self
    }

    pub fn estimated_tokens_per_request(mut self, tokens: u32) -> Self {
        self.config.estimated_tokens_per_request = tokens;
        self
    }

    pub fn max_wait_per_attempt(mut self, wait: Duration) -> Self {
        self.config.max_wait_per_attempt = wait;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<MemoryRateLimiter, ConfigError> {
        self.config.validate()?;
        Ok(MemoryRateLimiter::from_parts(self.config, self.clock, self.sleeper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::TrackingSleeper;
    use http::Method;

    const PATH: &str = "/universe/types/{type_id}/";

    fn limiter() -> (MemoryRateLimiter, ManualClock, TrackingSleeper) {
        let clock = ManualClock::starting_at(1_000);
        let sleeper = TrackingSleeper::advancing(clock.clone());
        let limiter = MemoryRateLimiter::builder()
            .clock(clock.clone())
            .sleeper(sleeper.clone())
            .build()
            .unwrap();
        (limiter, clock, sleeper)
    }

    fn headers(group: &str, limit: &str, remaining: Option<&str>) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("X-Ratelimit-Group".to_string(), group.to_string());
        h.insert("X-Ratelimit-Limit".to_string(), limit.to_string());
        if let Some(r) = remaining {
            h.insert("X-Ratelimit-Remaining".to_string(), r.to_string());
        }
        h
    }

    fn public() -> RequestDescriptor {
        RequestDescriptor::new(Method::GET, PATH)
    }

    async fn respond(
        limiter: &MemoryRateLimiter,
        descriptor: &RequestDescriptor,
        owner: Owner,
        response: HashMap<String, String>,
    ) {
        let completion = limiter.schedule(&WaitContext::new(), descriptor, owner).await.unwrap();
        completion.complete(&response);
    }

    fn consumed(limiter: &MemoryRateLimiter, group: &str, owner: BoundOwner) -> u64 {
        let key = BucketKey { group: group.to_string(), owner };
        read(&limiter.shared.buckets).get(&key).map(|b| b.consumed()).expect("bucket exists")
    }

    #[tokio::test]
    async fn unknown_endpoint_is_never_delayed() {
        let (limiter, _clock, sleeper) = limiter();
        let completion =
            limiter.schedule(&WaitContext::new(), &public(), Owner::Anonymous).await.unwrap();
        completion.abandon();

        assert!(sleeper.calls().is_empty());
        assert!(limiter.buckets().is_empty());
        assert!(limiter.group_for_path(PATH).is_none());
    }

    #[tokio::test]
    async fn response_binds_path_and_corrects_bucket() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("static", "100/10s", Some("30")))
            .await;

        let group = limiter.group_for_path(PATH).unwrap();
        assert_eq!(group.name, "static");
        assert_eq!(group.capacity, 100);

        let buckets = limiter.buckets();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].owner, BoundOwner::Shared);
        assert_eq!(buckets[0].effective_tokens, 70);

        // The next call claims the estimate on top of the corrected count.
        let completion =
            limiter.schedule(&WaitContext::new(), &public(), Owner::Anonymous).await.unwrap();
        assert_eq!(consumed(&limiter, "static", BoundOwner::Shared), 75);
        completion.abandon();
        assert_eq!(consumed(&limiter, "static", BoundOwner::Shared), 75);
    }

    #[tokio::test]
    async fn waits_until_usage_reaches_target() {
        let (limiter, _clock, sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("static", "100/10s", Some("0")))
            .await;

        let completion =
            limiter.schedule(&WaitContext::new(), &public(), Owner::Anonymous).await.unwrap();
        drop(completion);

        // 100 -> 75 tokens at 100ms per token.
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(2500)]);
        // The claim lands on the raw count and restarts decay from now.
        assert_eq!(consumed(&limiter, "static", BoundOwner::Shared), 105);
    }

    #[tokio::test]
    async fn single_wait_is_capped() {
        let (limiter, _clock, sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("slow", "10/1h", Some("0"))).await;

        let _ = limiter.schedule(&WaitContext::new(), &public(), Owner::Anonymous).await.unwrap();

        // 3 tokens at 6 minutes each, re-read every 10 seconds.
        let calls = sleeper.calls();
        assert_eq!(calls.len(), 108);
        assert!(calls.iter().all(|d| *d == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn cancelled_wait_claims_nothing() {
        let (limiter, _clock, sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("static", "100/10s", Some("0")))
            .await;

        let ctx = WaitContext::new();
        ctx.cancel();
        let err = limiter.schedule(&ctx, &public(), Owner::Anonymous).await.unwrap_err();

        assert_eq!(err, ScheduleError::Cancelled);
        assert!(sleeper.calls().is_empty());
        assert_eq!(consumed(&limiter, "static", BoundOwner::Shared), 100);
    }

    #[tokio::test]
    async fn cancelled_context_fails_even_without_delay() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("static", "100/10s", Some("90")))
            .await;

        let ctx = WaitContext::new();
        ctx.cancel();
        let err = limiter.schedule(&ctx, &public(), Owner::Anonymous).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(consumed(&limiter, "static", BoundOwner::Shared), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_wait_without_claim() {
        let limiter = MemoryRateLimiter::new();
        respond(&limiter, &public(), Owner::Anonymous, headers("static", "100/10s", Some("0")))
            .await;

        let ctx = WaitContext::new().with_timeout(Duration::from_secs(1));
        let err = limiter.schedule(&ctx, &public(), Owner::Anonymous).await.unwrap_err();

        assert_eq!(err, ScheduleError::DeadlineExceeded);
        assert_eq!(consumed(&limiter, "static", BoundOwner::Shared), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_time_drives_default_limiter() {
        let limiter = MemoryRateLimiter::new();
        respond(&limiter, &public(), Owner::Anonymous, headers("static", "100/10s", Some("0")))
            .await;

        let start = tokio::time::Instant::now();
        let _ = limiter.schedule(&WaitContext::new(), &public(), Owner::Anonymous).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2600), "{elapsed:?}");
    }

    #[tokio::test]
    async fn owner_binding_picks_buckets() {
        let (limiter, _clock, _sleeper) = limiter();
        let unscoped = RequestDescriptor::new(Method::GET, "/markets/prices/");
        let scoped = RequestDescriptor::new(Method::GET, "/characters/{character_id}/wallet/")
            .with_scope("esi-wallet.read_character_wallet.v1");
        let response = || headers("shared-group", "100/10s", None);

        // Bind both paths to the same group. Unbound paths claim nothing.
        respond(&limiter, &unscoped, Owner::Anonymous, response()).await;
        respond(&limiter, &scoped, Owner::Anonymous, response()).await;
        assert!(limiter.buckets().is_empty());

        for descriptor in [&unscoped, &scoped] {
            respond(&limiter, descriptor, Owner::Anonymous, response()).await;
        }
        for subject in [1, 2] {
            respond(&limiter, &unscoped, Owner::Subject(subject), response()).await;
        }
        for subject in [1, 2] {
            respond(&limiter, &scoped, Owner::Subject(subject), response()).await;
        }

        let owners: Vec<BoundOwner> = limiter.buckets().into_iter().map(|b| b.owner).collect();
        assert_eq!(
            owners,
            vec![
                BoundOwner::Application,
                BoundOwner::Shared,
                BoundOwner::Subject(1),
                BoundOwner::Subject(2),
            ]
        );
        assert_eq!(consumed(&limiter, "shared-group", BoundOwner::Shared), 10);
        assert_eq!(consumed(&limiter, "shared-group", BoundOwner::Application), 10);
        assert_eq!(consumed(&limiter, "shared-group", BoundOwner::Subject(1)), 5);
    }

    #[tokio::test]
    async fn group_limits_are_corrected_in_place() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("50"))).await;
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "200/20s", None)).await;

        assert_eq!(
            limiter.groups(),
            vec![GroupInfo { name: "g".into(), capacity: 200, window: Duration::from_secs(20) }]
        );
        assert_eq!(limiter.buckets()[0].capacity, 200);
    }

    #[tokio::test]
    async fn path_is_rebound_when_group_changes() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("old", "100/10s", None)).await;
        respond(&limiter, &public(), Owner::Anonymous, headers("new", "300/1m", None)).await;

        assert_eq!(limiter.group_for_path(PATH).unwrap().name, "new");
        assert_eq!(limiter.groups().len(), 2);
    }

    #[tokio::test]
    async fn malformed_or_missing_headers_leave_model_alone() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("40"))).await;

        respond(&limiter, &public(), Owner::Anonymous, headers("other", "lots/10s", Some("0")))
            .await;
        respond(&limiter, &public(), Owner::Anonymous, HashMap::new()).await;

        assert_eq!(limiter.group_for_path(PATH).unwrap().name, "g");
        assert_eq!(limiter.groups().len(), 1);
        // 60 corrected, then two uncorrected eager claims.
        assert_eq!(consumed(&limiter, "g", BoundOwner::Shared), 70);
    }

    #[tokio::test]
    async fn missing_remaining_keeps_eager_claim() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("100"))).await;
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("soon")))
            .await;
        assert_eq!(consumed(&limiter, "g", BoundOwner::Shared), 5);
    }

    #[tokio::test]
    async fn cleanup_boundary_is_strict() {
        let (limiter, clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("99"))).await;

        clock.advance(Duration::from_secs(20));
        assert_eq!(limiter.cleanup_expired_buckets(), 0);
        assert_eq!(limiter.buckets().len(), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(limiter.cleanup_expired_buckets(), 1);
        assert!(limiter.buckets().is_empty());
        // Group and path bindings survive the sweep.
        assert!(limiter.group_for_path(PATH).is_some());
    }

    #[tokio::test]
    async fn cleanup_uses_corrected_window() {
        let (limiter, clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("99"))).await;
        let other = RequestDescriptor::new(Method::GET, "/other/");
        respond(&limiter, &other, Owner::Subject(7), headers("g", "100/1m", None)).await;

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.cleanup_expired_buckets(), 0);
    }

    #[tokio::test]
    async fn cleanup_keeps_bucket_touched_after_snapshot() {
        let (limiter, clock, _sleeper) = limiter();
        let scoped = RequestDescriptor::new(Method::GET, PATH).with_scope("scope");
        respond(&limiter, &scoped, Owner::Subject(1), headers("g", "100/10s", Some("99"))).await;
        respond(&limiter, &scoped, Owner::Subject(2), headers("g", "100/10s", Some("99"))).await;
        assert_eq!(limiter.buckets().len(), 2);

        clock.advance(Duration::from_secs(21));
        let now = clock.now_millis();
        let expired = limiter.shared.expired_keys(now);
        assert_eq!(expired.len(), 2);

        let group = limiter.shared.group_for_path(PATH).unwrap();
        limiter.shared.bucket(&group, BoundOwner::Subject(1)).claim(1);

        assert_eq!(limiter.shared.remove_expired(expired, now), 1);
        let owners: Vec<BoundOwner> = limiter.buckets().into_iter().map(|b| b.owner).collect();
        assert_eq!(owners, vec![BoundOwner::Subject(1)]);
    }

    /// Advances the clock and empties the bucket table on every sleep.
    #[derive(Debug)]
    struct SweepingSleeper {
        clock: ManualClock,
        shared: Arc<std::sync::OnceLock<std::sync::Weak<Shared>>>,
    }

    impl Sleeper for SweepingSleeper {
        fn sleep(
            &self,
            duration: Duration,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
            self.clock.advance(duration);
            if let Some(shared) = self.shared.get().and_then(|weak| weak.upgrade()) {
                write(&shared.buckets).clear();
            }
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn claim_lands_on_bucket_that_was_waited_on() {
        let clock = ManualClock::new();
        let slot = Arc::new(std::sync::OnceLock::new());
        let limiter = MemoryRateLimiter::builder()
            .clock(clock.clone())
            .sleeper(SweepingSleeper { clock, shared: slot.clone() })
            .build()
            .unwrap();
        slot.set(Arc::downgrade(&limiter.shared)).unwrap();

        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("0"))).await;
        let group = limiter.shared.group_for_path(PATH).unwrap();
        let waited = limiter.shared.bucket(&group, BoundOwner::Shared);

        let completion =
            limiter.schedule(&WaitContext::new(), &public(), Owner::Anonymous).await.unwrap();
        completion.abandon();

        assert_eq!(waited.consumed(), 105);
        assert!(limiter.buckets().is_empty());
    }

    #[tokio::test]
    async fn negative_remaining_marks_quota_overdrawn() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("100"))).await;
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("-3"))).await;

        assert_eq!(limiter.buckets()[0].effective_tokens, 103);
    }

    #[cfg(feature = "serde")]
    #[tokio::test]
    async fn bucket_info_serializes_idle_as_humantime() {
        let (limiter, clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("40"))).await;
        clock.advance(Duration::from_secs(3));

        let info = limiter.buckets().remove(0);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["group"], "g");
        assert_eq!(json["owner"], "shared");
        assert_eq!(json["effective_tokens"], 30);
        assert_eq!(json["idle"], "3s");

        let back: BucketInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[tokio::test]
    async fn set_config_takes_effect() {
        let (limiter, _clock, sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "100/10s", Some("20"))).await;

        limiter
            .set_config(RateLimiterConfig { target_fraction: 0.5, ..RateLimiterConfig::default() })
            .unwrap();
        let _ = limiter.schedule(&WaitContext::new(), &public(), Owner::Anonymous).await.unwrap();
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(3)]);

        let bad = RateLimiterConfig { target_fraction: 2.0, ..RateLimiterConfig::default() };
        assert!(limiter.set_config(bad).is_err());
        assert_eq!(limiter.config().target_fraction, 0.5);
    }

    #[test]
    fn builder_validates() {
        let err = MemoryRateLimiter::builder().target_fraction(0.0).build().unwrap_err();
        assert_eq!(err, ConfigError::InvalidTargetFraction(0.0));

        let limiter = MemoryRateLimiter::builder()
            .estimated_tokens_per_request(1)
            .max_wait_per_attempt(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(limiter.config().estimated_tokens_per_request, 1);
        assert_eq!(limiter.config().max_wait_per_attempt, Duration::from_secs(2));
    }

    #[test]
    fn instances_do_not_share_state() {
        let a = MemoryRateLimiter::new();
        let b = MemoryRateLimiter::new();
        a.shared.upsert_group("g", Limits::new(1, Duration::from_secs(1)).unwrap());
        assert_eq!(a.groups().len(), 1);
        assert!(b.groups().is_empty());
        assert_eq!(a.clone().groups().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_schedules_all_claim() {
        let (limiter, _clock, _sleeper) = limiter();
        respond(&limiter, &public(), Owner::Anonymous, headers("g", "1000/10s", Some("1000")))
            .await;

        let mut handles = vec![];
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let completion = limiter
                    .schedule(&WaitContext::new(), &public(), Owner::Anonymous)
                    .await
                    .unwrap();
                completion.abandon();
            }));
        }
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(consumed(&limiter, "g", BoundOwner::Shared), 100);
    }
}
