//! Header-driven backoff computation (spec §4.1).
//!
//! Unlike the teacher's `backend::BackoffConfig` (exponential-with-jitter,
//! used when no provider gives us a hint), this engine only ever derives a
//! delay from response headers: `Retry-After`, `RateLimit-Reset`, or Kong's
//! `X-RateLimit-Remaining-*` trio. No header, no retry — grounded on
//! `original_source/as_models/api_support.py::backoff_from_headers`.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Sentinel that disables the method/status retryability check entirely —
/// required when the underlying HTTP library discards the original method
/// (e.g. WebOb-style error types, per the Python original's comment on
/// `ANY`).
pub const ANY: &str = "ANY";

pub fn default_retryable_methods() -> Vec<String> {
    ["HEAD", "GET", "OPTIONS", "PUT", "DELETE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_retryable_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

/// RFC 7231 §7.1.1.1 IMF-fixdate, as emitted by `Retry-After`/`RateLimit-Reset`.
const RFC_7231_TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Policy governing which failures are retryable and how many attempts are
/// allowed.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub retryable_methods: Vec<String>,
    pub retryable_statuses: Vec<u16>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retryable_methods: default_retryable_methods(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl BackoffPolicy {
    pub fn allow_any_method(mut self) -> Self {
        self.retryable_methods = vec![ANY.to_string()];
        self
    }

    pub fn is_method_retryable(&self, method: Option<&str>) -> bool {
        if self.retryable_methods.iter().any(|m| m == ANY) {
            return true;
        }
        match method {
            Some(m) => self
                .retryable_methods
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(m)),
            None => false,
        }
    }

    pub fn is_status_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    pub fn is_retryable(&self, method: Option<&str>, status: u16) -> bool {
        self.is_method_retryable(method) && self.is_status_retryable(status)
    }
}

/// Parse a `Retry-After`/`RateLimit-Reset` header value: either a
/// non-negative float number of seconds, or an RFC-7231 HTTP-date in GMT.
/// Date form returns `max(0, target - now)` seconds.
pub fn parse_retry_delay(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_finite() {
            return Some(Duration::from_secs_f64(seconds.max(0.0)));
        }
    }

    let naive = chrono::NaiveDateTime::parse_from_str(trimmed, RFC_7231_TIMESTAMP_FORMAT).ok()?;
    let target = Utc.from_utc_datetime(&naive);
    let delta = (target - now).num_milliseconds();
    Some(Duration::from_millis(delta.max(0) as u64))
}

/// Kong-style headers and the half-period backoff to apply when a header's
/// value is exactly `"0"`, scanned in this order.
const KONG_RATE_LIMIT_HEADERS: &[(&str, f64)] = &[
    ("x-ratelimit-remaining-second", 0.5),
    ("x-ratelimit-remaining-minute", 30.0),
    ("x-ratelimit-remaining-hour", 1800.0),
];

/// Determine an appropriate backoff from a response's headers, following
/// the precedence in spec §4.1: `Retry-After`, then `RateLimit-Reset`, then
/// Kong's `X-RateLimit-Remaining-*`. Matching is case-insensitive. Returns
/// `None` if no header yields a usable delay.
pub fn backoff_from_headers(headers: &HashMap<String, String>, now: DateTime<Utc>) -> Option<Duration> {
    let lower: HashMap<String, &String> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    for header in ["retry-after", "ratelimit-reset"] {
        if let Some(value) = lower.get(header) {
            if let Some(delay) = parse_retry_delay(value, now) {
                return Some(delay);
            }
        }
    }

    for (header, half_period) in KONG_RATE_LIMIT_HEADERS {
        if let Some(value) = lower.get(*header) {
            if value.trim() == "0" {
                return Some(Duration::from_secs_f64(*half_period));
            }
        }
    }

    None
}
