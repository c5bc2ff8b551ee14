//! HTTP dates and `Age` computation.

use chrono::{DateTime, Utc};
use http::header::{AGE, DATE, HeaderName, HeaderValue};
use http::HeaderMap;
use thiserror::Error;

/// Header carrying the freshness lifetime a response was stored with, in seconds.
pub const STORED_TTL_HEADER: HeaderName = HeaderName::from_static("x-stashbox-stored-ttl");

/// Header carrying the body length a response was stored with.
pub const STORED_LENGTH_HEADER: HeaderName = HeaderName::from_static("x-stashbox-stored-length");

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A date header could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed http date `{0}`")]
pub struct MalformedDate(pub String);

/// Parses an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, MalformedDate> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|_| MalformedDate(value.to_owned()))
}

/// Formats an instant as an IMF-fixdate.
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format(HTTP_DATE_FORMAT).to_string()
}

/// Whole seconds elapsed since `date`, rounded up and never negative.
pub fn apparent_age(date: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (now - date).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis as u64).div_ceil(1000)
}

/// Reads the `Date` header.
///
/// Returns `Ok(None)` when absent and an error when present but malformed.
pub fn date(headers: &HeaderMap) -> Result<Option<DateTime<Utc>>, MalformedDate> {
    match headers.get(DATE) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| MalformedDate(String::from_utf8_lossy(value.as_bytes()).into_owned()))?;
            parse_http_date(value).map(Some)
        }
    }
}

/// Sets `Date` to `now` unless the response already has one.
pub fn ensure_date(headers: &mut HeaderMap, now: DateTime<Utc>) {
    if !headers.contains_key(DATE) {
        if let Ok(value) = HeaderValue::from_str(&format_http_date(now)) {
            headers.insert(DATE, value);
        }
    }
}

/// Updates `Age` of a stored response about to be served and returns it.
///
/// The new age is the stored `Age` plus the apparent age derived from `Date`.
pub fn refresh_age(headers: &mut HeaderMap, now: DateTime<Utc>) -> u64 {
    let previous = headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let apparent = date(headers)
        .ok()
        .flatten()
        .map(|date| apparent_age(date, now))
        .unwrap_or(0);
    let age = previous.saturating_add(apparent);
    headers.insert(AGE, HeaderValue::from(age));
    age
}

/// Freshness lifetime recorded at store time, in seconds.
pub fn stored_ttl(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(STORED_TTL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}
