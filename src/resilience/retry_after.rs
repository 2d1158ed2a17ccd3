//! `Retry-After` interpretation.
//!
//! Upstreams express the hint either as delta-seconds (`Retry-After: 120`) or
//! as an HTTP-date (`Retry-After: Wed, 21 Oct 2015 07:28:00 GMT`, or one of the
//! obsolete RFC 850 and asctime forms). In-process
//! callers may also hand over an already numeric value. Anything else, or a
//! date that is not in the future, yields `None` and the caller falls back to
//! its own default.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use std::time::Duration;

pub const RETRY_AFTER_HEADER: &str = "retry-after";

const RFC850_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// A raw retry hint as found in a header mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryHint<'a> {
    /// Already numeric, in seconds.
    Seconds(f64),
    /// Header text, either delta-seconds or an HTTP-date.
    Text(&'a str),
}

impl<'a> From<&'a str> for RetryHint<'a> {
    fn from(value: &'a str) -> Self {
        RetryHint::Text(value)
    }
}

impl From<u64> for RetryHint<'_> {
    fn from(value: u64) -> Self {
        RetryHint::Seconds(value as f64)
    }
}

/// Normalize a retry hint into a wait duration, relative to the current time.
pub fn parse_retry_after(hint: Option<RetryHint<'_>>) -> Option<Duration> {
    parse_retry_after_at(hint, Utc::now())
}

/// Same as [`parse_retry_after`] with an explicit "now" for HTTP-date hints.
pub fn parse_retry_after_at(hint: Option<RetryHint<'_>>, now: DateTime<Utc>) -> Option<Duration> {
    match hint? {
        RetryHint::Seconds(secs) => positive_seconds(secs),
        RetryHint::Text(raw) => {
            let raw = raw.trim();
            if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
                // Overlong digit strings saturate rather than fail.
                let secs = raw.parse::<u64>().unwrap_or(u64::MAX);
                return (secs > 0).then(|| Duration::from_secs(secs));
            }
            let at = parse_http_date(raw)?;
            let wait_ms = at.signed_duration_since(now).num_milliseconds();
            (wait_ms > 0).then(|| Duration::from_millis(wait_ms as u64))
        }
    }
}

/// Read and parse the `retry-after` header, if present.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER_HEADER)?.to_str().ok()?;
    parse_retry_after(Some(RetryHint::Text(raw)))
}

fn positive_seconds(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

// IMF-fixdate is a subset of RFC 2822 as far as chrono is concerned; RFC 3339
// is accepted too since some gateways emit it. The obsolete forms carry no
// offset and are always UTC.
fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc2822(raw).or_else(|_| DateTime::parse_from_rfc3339(raw)) {
        return Some(at.with_timezone(&Utc));
    }
    [RFC850_FORMAT, ASCTIME_FORMAT]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
