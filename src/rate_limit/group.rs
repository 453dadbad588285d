//! Quota groups advertised by the server.

use crate::error::InvalidHeader;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

/// Capacity and replenishment window of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    capacity: u32,
    window: Duration,
}

impl Limits {
    /// Build limits, rejecting a zero capacity or window.
    pub fn new(capacity: u32, window: Duration) -> Option<Self> {
        (capacity > 0 && !window.is_zero()).then_some(Self { capacity, window })
    }

    /// Parse the `<capacity>/<window>` form used by `X-Ratelimit-Limit`, e.g. `150/15m`.
    ///
    /// Window units are limited to `ns`, `us`, `µs`, `ms`, `s`, `m` and `h`, which may be
    /// combined (`1h30m`).
    pub fn parse(encoded: &str) -> Result<Self, InvalidHeader> {
        if encoded.is_empty() {
            return Err(InvalidHeader::EmptyLimit);
        }

        let mut parts = encoded.split('/');
        let (Some(capacity), Some(window), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(InvalidHeader::Malformed(encoded.to_string()));
        };

        let capacity = capacity
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| InvalidHeader::Capacity(capacity.to_string()))?;
        let window = Some(window.trim())
            .filter(|w| has_known_units(w))
            .and_then(|w| humantime::parse_duration(w).ok())
            .filter(|w| !w.is_zero())
            .ok_or_else(|| InvalidHeader::Window(window.to_string()))?;

        Ok(Self { capacity, window })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Time for one token to regenerate, floored to whole milliseconds.
    pub fn time_per_token(&self) -> Duration {
        let millis = self.window.as_millis() / u128::from(self.capacity);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Token count at the given utilization fraction, floored.
    pub fn target_size(&self, fraction: f64) -> u64 {
        (f64::from(self.capacity) * fraction).floor().max(0.0) as u64
    }
}

const WINDOW_UNITS: [&str; 7] = ["ns", "us", "µs", "ms", "s", "m", "h"];

fn has_known_units(window: &str) -> bool {
    window
        .split(|c: char| c.is_ascii_digit() || c.is_whitespace())
        .filter(|unit| !unit.is_empty())
        .all(|unit| WINDOW_UNITS.contains(&unit))
}

/// A named quota class.
///
/// Identity is the name. The limits can be corrected in place, so every bucket holding the
/// same `Arc<Group>` sees the new capacity and window on its next read.
#[derive(Debug)]
pub struct Group {
    name: String,
    limits: ArcSwap<Limits>,
}

impl Group {
    pub fn new(name: impl Into<String>, limits: Limits) -> Self {
        Self { name: name.into(), limits: ArcSwap::from_pointee(limits) }
    }

    /// Parse a group from its `X-Ratelimit-Group` / `X-Ratelimit-Limit` header pair.
    pub fn parse(name: &str, encoded_limit: &str) -> Result<Self, InvalidHeader> {
        if name.is_empty() {
            return Err(InvalidHeader::EmptyName);
        }
        let limits = Limits::parse(encoded_limit)?;
        Ok(Self::new(name, limits))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current limits snapshot.
    pub fn limits(&self) -> Limits {
        **self.limits.load()
    }

    pub fn capacity(&self) -> u32 {
        self.limits().capacity
    }

    pub fn window(&self) -> Duration {
        self.limits().window
    }

    /// Replace the limits, returning the previous ones.
    pub fn update(&self, limits: Limits) -> Limits {
        *self.limits.swap(Arc::new(limits))
    }

    pub fn time_per_token(&self) -> Duration {
        self.limits().time_per_token()
    }

    pub fn target_size(&self, fraction: f64) -> u64 {
        self.limits().target_size(fraction)
    }

    pub fn info(&self) -> GroupInfo {
        let limits = self.limits();
        GroupInfo { name: self.name.clone(), capacity: limits.capacity, window: limits.window }
    }
}

/// Read-only snapshot of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupInfo {
    pub name: String,
    pub capacity: u32,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub window: Duration,
}
