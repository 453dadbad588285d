use headroom::{ManualClock, MemoryRateLimiter, TrackingSleeper};
use http::Response;

/// A limiter on a manual clock whose sleeps advance that clock.
pub fn manual_limiter() -> (MemoryRateLimiter, ManualClock, TrackingSleeper) {
    let clock = ManualClock::starting_at(10_000);
    let sleeper = TrackingSleeper::advancing(clock.clone());
    let limiter = MemoryRateLimiter::builder()
        .clock(clock.clone())
        .sleeper(sleeper.clone())
        .build()
        .expect("default config is valid");
    (limiter, clock, sleeper)
}

/// A response carrying quota headers. `remaining` is omitted when `None`.
pub fn quota_response(group: &str, limit: &str, remaining: Option<u64>) -> Response<()> {
    let mut builder =
        Response::builder().header("x-ratelimit-group", group).header("x-ratelimit-limit", limit);
    if let Some(remaining) = remaining {
        builder = builder.header("x-ratelimit-remaining", remaining.to_string());
    }
    builder.body(()).expect("valid response")
}
