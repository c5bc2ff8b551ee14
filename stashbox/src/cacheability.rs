//! Whether an origin response may be stored, and in which shape.

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, HeaderValue};
use http::{HeaderMap, StatusCode};
use stashbox_core::{
    RequestCacheControl, ResponseCacheControl, STORED_LENGTH_HEADER, STORED_TTL_HEADER,
    StoredResponse, Vary, age,
};

use crate::cache_status::detail;
use crate::config::CompiledConfig;

/// Statuses a shared cache stores.
pub const CACHEABLE_STATUS_CODES: [u16; 11] = [200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

pub fn is_cacheable_status(status: StatusCode) -> bool {
    CACHEABLE_STATUS_CODES.contains(&status.as_u16())
}

/// Origin statuses treated as a failure of the origin.
///
/// They trigger the stale-if-error fallback the same way a transport error does.
pub fn is_upstream_error(status: StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

/// A response that passed classification.
#[derive(Debug, Clone)]
pub struct Storable {
    pub cache_control: ResponseCacheControl,
    pub vary: Vary,
}

/// Classifies a response to `request`.
///
/// Returns the reason code rendered in `Cache-Status` when it must not be
/// stored. `response` should already carry the default `Cache-Control`, see
/// [`apply_default_cache_control`].
pub fn classify(
    config: &CompiledConfig,
    request: &HeaderMap,
    request_cc: &RequestCacheControl,
    response: &StoredResponse,
) -> Result<Storable, &'static str> {
    let mode = config.config.mode;
    if !is_cacheable_status(response.status()) {
        return Err(detail::UNCACHEABLE_STATUS_CODE);
    }
    let cache_control = ResponseCacheControl::parse(response.headers())
        .map_err(|_| detail::INVALID_RESPONSE_CACHE_CONTROL)?;

    if request_cc.no_store && !mode.ignores_request() {
        return Err(detail::NO_STORE_DIRECTIVE);
    }
    if cache_control.no_store && !mode.ignores_response() {
        return Err(detail::NO_STORE_DIRECTIVE);
    }

    let vary = Vary::from_headers(response.headers());
    if vary.is_star() {
        return Err(detail::UPSTREAM_VARY_STAR);
    }
    if !mode.ignores_response() && !config.config.authorization.allows(request, &cache_control, &vary) {
        return Err(detail::PRIVATE_OR_AUTHENTICATED_RESPONSE);
    }

    Ok(Storable { cache_control, vary })
}

/// Sets the configured `Cache-Control` on a response that has none.
pub fn apply_default_cache_control(headers: &mut HeaderMap, default: Option<&HeaderValue>) {
    if let Some(default) = default {
        if !headers.contains_key(CACHE_CONTROL) {
            headers.insert(CACHE_CONTROL, default.clone());
        }
    }
}

/// Shapes a classified response for storage.
///
/// Drops the headers named by `no-cache="..."` and `private="..."`, then
/// records `Date`, the body length and the freshness lifetime.
pub fn prepare(
    mut response: StoredResponse,
    cache_control: &ResponseCacheControl,
    ttl: Duration,
    now: DateTime<Utc>,
) -> StoredResponse {
    let length = response.body().len();
    let headers = response.headers_mut();
    for field in cache_control
        .no_cache_fields
        .iter()
        .chain(&cache_control.private_fields)
    {
        headers.remove(field.as_str());
    }
    age::ensure_date(headers, now);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(STORED_LENGTH_HEADER, HeaderValue::from(length));
    headers.insert(STORED_TTL_HEADER, HeaderValue::from(ttl.as_secs()));
    response
}
