//! Prometheus gauges for `headroom`.
//! Bring your own `prometheus::Registry`; call [`BucketGauges::refresh`] before each scrape.

use headroom::MemoryRateLimiter;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tracing::trace;

/// Bucket and group gauges fed from a limiter's snapshots.
#[derive(Clone, Debug)]
pub struct BucketGauges {
    registry: Arc<Registry>,
    effective_tokens: IntGaugeVec,
    idle_seconds: IntGaugeVec,
    group_capacity: IntGaugeVec,
    buckets: IntGauge,
}

impl BucketGauges {
    /// Create the gauges and register them into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let effective_tokens = IntGaugeVec::new(
            Opts::new("headroom_bucket_effective_tokens", "Decayed tokens consumed per bucket"),
            &["group", "owner"],
        )?;
        let idle_seconds = IntGaugeVec::new(
            Opts::new("headroom_bucket_idle_seconds", "Seconds since last claim or correction"),
            &["group", "owner"],
        )?;
        let group_capacity = IntGaugeVec::new(
            Opts::new("headroom_group_capacity", "Server-advertised tokens per window"),
            &["group"],
        )?;
        let buckets = IntGauge::new("headroom_buckets", "Live buckets")?;

        registry.register(Box::new(effective_tokens.clone()))?;
        registry.register(Box::new(idle_seconds.clone()))?;
        registry.register(Box::new(group_capacity.clone()))?;
        registry.register(Box::new(buckets.clone()))?;
        Ok(Self { registry, effective_tokens, idle_seconds, group_capacity, buckets })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Replace every gauge with the limiter's current state.
    ///
    /// Series of buckets removed since the last refresh disappear.
    pub fn refresh(&self, limiter: &MemoryRateLimiter) {
        let buckets = limiter.buckets();
        let groups = limiter.groups();

        self.effective_tokens.reset();
        self.idle_seconds.reset();
        self.group_capacity.reset();

        for bucket in &buckets {
            let owner = bucket.owner.to_string();
            let labels = [bucket.group.as_str(), owner.as_str()];
            let tokens = saturating_i64(bucket.effective_tokens);
            self.effective_tokens.with_label_values(&labels).set(tokens);
            self.idle_seconds.with_label_values(&labels).set(saturating_i64(bucket.idle.as_secs()));
        }
        for group in &groups {
            let capacity = i64::from(group.capacity);
            self.group_capacity.with_label_values(&[group.name.as_str()]).set(capacity);
        }
        self.buckets.set(i64::try_from(buckets.len()).unwrap_or(i64::MAX));
        trace!(buckets = buckets.len(), groups = groups.len(), "rate limit gauges refreshed");
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
