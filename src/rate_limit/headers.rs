//! Reading the server's quota headers from a response.

use crate::error::InvalidHeader;
use crate::rate_limit::group::Limits;
use http::HeaderMap;
use std::collections::HashMap;

/// Name of the quota group governing the endpoint.
pub const GROUP_HEADER: &str = "x-ratelimit-group";
/// `<capacity>/<window>` of that group, e.g. `150/15m`.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Tokens the server says are left in the caller's bucket.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Anything header values can be looked up in. Lookups are case-insensitive.
pub trait QuotaHeaders {
    /// The value of `name`, if present and valid UTF-8.
    fn header(&self, name: &str) -> Option<&str>;
}

impl QuotaHeaders for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }
}

impl<B> QuotaHeaders for http::Response<B> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().header(name)
    }
}

impl QuotaHeaders for http::response::Parts {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.header(name)
    }
}

impl QuotaHeaders for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// Quota information carried by one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaReport {
    pub group: String,
    pub limits: Limits,
    /// Absent when the header is missing or not an integer. Negative when the quota is overdrawn.
    pub remaining: Option<i64>,
}

impl QuotaReport {
    /// Extract the report.
    ///
    /// `Ok(None)` when the group or limit header is missing: the server said nothing about
    /// quota for this call. `Err` when both are present but the pair does not parse.
    pub fn from_headers(headers: &dyn QuotaHeaders) -> Result<Option<Self>, InvalidHeader> {
        let value =
            |name: &'static str| headers.header(name).map(str::trim).filter(|v| !v.is_empty());

        let (Some(group), Some(limit)) = (value(GROUP_HEADER), value(LIMIT_HEADER)) else {
            return Ok(None);
        };
        let limits = Limits::parse(limit)?;
        let remaining = value(REMAINING_HEADER).and_then(|v| v.parse::<i64>().ok());

        Ok(Some(Self { group: group.to_string(), limits, remaining }))
    }
}
