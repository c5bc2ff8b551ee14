//! Freshness and revalidation decisions.
//!
//! [`decide_action`] is a pure function of the request directives, the
//! lookup result and the revalidator. It never performs I/O, the orchestrator
//! acts on the returned [`Decision`].
//!
//! | lookup          | conditions                                         | decision                        |
//! |-----------------|----------------------------------------------------|---------------------------------|
//! | anything        | request `no-cache`                                 | `Revalidate` or `Miss`          |
//! | fresh           | stored `no-cache`                                  | `Revalidate`                    |
//! | fresh           | client validators match                            | `ServeNotModified`              |
//! | fresh           | `max-age`/`min-fresh` violated, validator mismatch | `Revalidate`                    |
//! | fresh           | otherwise                                          | `ServeFresh`                    |
//! | stale only      | `must-revalidate`/`proxy-revalidate`               | `Revalidate` without fallback   |
//! | stale only      | `only-if-cached` and stale-if-error budget         | `ServeStaleOnError`             |
//! | stale only      | `stale-while-revalidate` or `max-stale` budget     | `ServeStaleWhileRevalidating`   |
//! | stale only      | otherwise                                          | `Revalidate` with SIE fallback  |
//! | nothing         |                                                    | `Miss`                          |

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::EXPIRES;
use thiserror::Error;

use crate::age::{self, MalformedDate};
use crate::directives::{RequestCacheControl, ResponseCacheControl};
use crate::mapping::{CachedEntry, Lookup};
use crate::revalidator::Revalidator;

/// Upper bound on any lifetime, keeps date arithmetic in range.
pub const MAX_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// What the orchestrator should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Serve the fresh entry as stored.
    ServeFresh,
    /// Answer with a bare `304 Not Modified`.
    ServeNotModified,
    /// Ask the origin, optionally falling back to the stored entry on failure.
    Revalidate {
        /// The stored entry may be served if the origin fails.
        stale_fallback: bool,
    },
    /// Serve the stale entry now and refresh it in the background.
    ServeStaleWhileRevalidating,
    /// Serve the stale entry because the origin cannot be asked.
    ServeStaleOnError,
    /// Nothing usable is stored.
    Miss,
}

/// Knobs of the decision engine coming from the cache mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionConfig {
    /// Ignore request `no-cache`.
    pub bypass_request: bool,
}

/// Chooses the action for a request.
///
/// `revalidator` must already have been validated against the elected entry,
/// which the mapping store does during lookup.
pub fn decide_action(
    request: &RequestCacheControl,
    lookup: &Lookup,
    revalidator: &Revalidator,
    config: DecisionConfig,
    now: DateTime<Utc>,
) -> Decision {
    if request.no_cache && !config.bypass_request {
        return match lookup.fresh.as_ref().or(lookup.stale.as_ref()) {
            Some(entry) => Decision::Revalidate {
                stale_fallback: stale_if_error_allows(request, entry, now),
            },
            None => Decision::Miss,
        };
    }

    if let Some(fresh) = &lookup.fresh {
        let stored = fresh.response.cache_control();
        if stored.no_cache {
            return Decision::Revalidate {
                stale_fallback: stale_if_error_allows(request, fresh, now),
            };
        }
        if revalidator.not_modified {
            return Decision::ServeNotModified;
        }
        let too_old = request
            .max_age
            .is_some_and(|max_age| entry_age(fresh, now) > max_age);
        let too_close = request
            .min_fresh
            .is_some_and(|min_fresh| fresh.variant.remaining_freshness(now) < min_fresh);
        if revalidator.need_revalidation || too_old || too_close {
            return Decision::Revalidate {
                stale_fallback: stale_if_error_allows(request, fresh, now),
            };
        }
        return Decision::ServeFresh;
    }

    if let Some(stale) = &lookup.stale {
        let stored = stale.response.cache_control();
        if stored.forbids_stale() {
            return Decision::Revalidate {
                stale_fallback: false,
            };
        }
        let staleness = stale.variant.staleness(now);
        if request.only_if_cached && stale_if_error_allows(request, stale, now) {
            return Decision::ServeStaleOnError;
        }
        let within_swr = stored
            .stale_while_revalidate
            .is_some_and(|budget| staleness <= budget);
        if within_swr || request.max_stale.allows(staleness) {
            return Decision::ServeStaleWhileRevalidating;
        }
        return Decision::Revalidate {
            stale_fallback: stale_if_error_allows(request, stale, now),
        };
    }

    Decision::Miss
}

/// The stored entry may be served in place of an origin error.
///
/// Both the request and the stored response may declare a budget, the larger
/// one applies.
pub fn stale_if_error_allows(
    request: &RequestCacheControl,
    entry: &CachedEntry,
    now: DateTime<Utc>,
) -> bool {
    let stored = entry.response.cache_control();
    if stored.forbids_stale() && !entry.variant.is_fresh(now) {
        return false;
    }
    let budget = match (request.stale_if_error, stored.stale_if_error) {
        (None, None) => return false,
        (a, b) => a.unwrap_or(0).max(b.unwrap_or(0)),
    };
    entry.variant.staleness(now) <= budget
}

fn entry_age(entry: &CachedEntry, now: DateTime<Utc>) -> u64 {
    let previous = entry
        .response
        .headers()
        .get(http::header::AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    let apparent = age::date(entry.response.headers())
        .ok()
        .flatten()
        .map(|date| age::apparent_age(date, now))
        .unwrap_or_else(|| age::apparent_age(entry.variant.stored_at(), now));
    previous.saturating_add(apparent)
}

/// A response header needed for freshness computation is unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FreshnessError {
    #[error("malformed Date header: {0}")]
    MalformedDate(MalformedDate),
    #[error("malformed Expires header: {0}")]
    MalformedExpires(MalformedDate),
}

impl FreshnessError {
    /// Reason code used in diagnostics.
    pub fn detail(&self) -> &'static str {
        match self {
            FreshnessError::MalformedDate(_) => "MALFORMED-DATE",
            FreshnessError::MalformedExpires(_) => "MALFORMED-EXPIRES",
        }
    }
}

/// Freshness lifetime of a response about to be stored.
///
/// `s-maxage` wins over `max-age`, which wins over `Expires`. The declared
/// value is clamped to `configured`, the statically configured TTL of the
/// route, and `configured` applies when nothing is declared.
pub fn freshness_lifetime(
    cc: &ResponseCacheControl,
    headers: &HeaderMap,
    configured: Duration,
    now: DateTime<Utc>,
) -> Result<Duration, FreshnessError> {
    let date = age::date(headers)
        .map_err(FreshnessError::MalformedDate)?
        .unwrap_or(now);

    let declared = match cc.declared_max_age() {
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => expires_lifetime(headers, date)?,
    };
    Ok(declared.map_or(configured, |declared| declared.min(configured)))
}

fn expires_lifetime(
    headers: &HeaderMap,
    date: DateTime<Utc>,
) -> Result<Option<Duration>, FreshnessError> {
    let Some(value) = headers.get(EXPIRES) else {
        return Ok(None);
    };
    let raw = value.to_str().unwrap_or_default();
    let expires = age::parse_http_date(raw).map_err(FreshnessError::MalformedExpires)?;
    Ok(Some((expires - date).to_std().unwrap_or(Duration::ZERO)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::MaxStale;
    use crate::mapping::Variant;
    use crate::response::StoredResponse;
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use http::header::{CACHE_CONTROL, DATE};
    use http::{HeaderValue, StatusCode};
    use smol_str::SmolStr;

    fn entry(cache_control: &str, fresh_for: i64, stale_for: i64) -> CachedEntry {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        if !cache_control.is_empty() {
            headers.insert(CACHE_CONTROL, HeaderValue::from_str(cache_control).unwrap());
        }
        headers.insert(
            DATE,
            HeaderValue::from_str(&age::format_http_date(now)).unwrap(),
        );
        CachedEntry {
            variant: Variant::new(
                "key",
                vec![],
                now,
                now + ChronoDuration::seconds(fresh_for),
                now + ChronoDuration::seconds(stale_for),
                None,
            ),
            response: StoredResponse::new(StatusCode::OK, headers, Bytes::new()),
            storage: SmolStr::new_static("test"),
        }
    }

    fn fresh(cc: &str) -> Lookup {
        Lookup {
            fresh: Some(entry(cc, 60, 120)),
            stale: None,
        }
    }

    fn stale(cc: &str, expired_for: i64) -> Lookup {
        Lookup {
            fresh: None,
            stale: Some(entry(cc, -expired_for, 600)),
        }
    }

    fn decide(request: &RequestCacheControl, lookup: &Lookup) -> Decision {
        decide_action(
            request,
            lookup,
            &Revalidator::default(),
            DecisionConfig::default(),
            Utc::now(),
        )
    }

    #[test]
    fn empty_lookup_is_a_miss() {
        assert_eq!(
            decide(&RequestCacheControl::default(), &Lookup::default()),
            Decision::Miss
        );
    }

    #[test]
    fn fresh_entry_is_served() {
        assert_eq!(
            decide(&RequestCacheControl::default(), &fresh("max-age=60")),
            Decision::ServeFresh
        );
    }

    #[test]
    fn request_no_cache_forces_revalidation() {
        let request = RequestCacheControl {
            no_cache: true,
            ..Default::default()
        };
        assert!(matches!(
            decide(&request, &fresh("max-age=60")),
            Decision::Revalidate { .. }
        ));
        assert_eq!(decide(&request, &Lookup::default()), Decision::Miss);

        let bypass = decide_action(
            &request,
            &fresh("max-age=60"),
            &Revalidator::default(),
            DecisionConfig {
                bypass_request: true,
            },
            Utc::now(),
        );
        assert_eq!(bypass, Decision::ServeFresh);
    }

    #[test]
    fn stored_no_cache_forces_revalidation() {
        assert!(matches!(
            decide(&RequestCacheControl::default(), &fresh("no-cache")),
            Decision::Revalidate { .. }
        ));
    }

    #[test]
    fn matching_validators_yield_not_modified() {
        let revalidator = Revalidator {
            matched: true,
            not_modified: true,
            ..Default::default()
        };
        let decision = decide_action(
            &RequestCacheControl::default(),
            &fresh("max-age=60"),
            &revalidator,
            DecisionConfig::default(),
            Utc::now(),
        );
        assert_eq!(decision, Decision::ServeNotModified);
    }

    #[test]
    fn min_fresh_beyond_remaining_lifetime_revalidates() {
        let request = RequestCacheControl {
            min_fresh: Some(300),
            ..Default::default()
        };
        assert!(matches!(
            decide(&request, &fresh("max-age=60")),
            Decision::Revalidate { .. }
        ));
    }

    #[test]
    fn stale_within_swr_budget_is_served_while_revalidating() {
        assert_eq!(
            decide(
                &RequestCacheControl::default(),
                &stale("max-age=1, stale-while-revalidate=30", 5)
            ),
            Decision::ServeStaleWhileRevalidating
        );
    }

    #[test]
    fn stale_past_swr_budget_revalidates_with_sie_fallback() {
        assert_eq!(
            decide(
                &RequestCacheControl::default(),
                &stale("stale-while-revalidate=2, stale-if-error=60", 10)
            ),
            Decision::Revalidate {
                stale_fallback: true
            }
        );
        assert_eq!(
            decide(&RequestCacheControl::default(), &stale("max-age=1", 10)),
            Decision::Revalidate {
                stale_fallback: false
            }
        );
    }

    #[test]
    fn max_stale_accepts_stale_entries() {
        let request = RequestCacheControl {
            max_stale: MaxStale::Limited(20),
            ..Default::default()
        };
        assert_eq!(
            decide(&request, &stale("max-age=1", 10)),
            Decision::ServeStaleWhileRevalidating
        );
    }

    #[test]
    fn must_revalidate_forbids_stale() {
        let request = RequestCacheControl {
            max_stale: MaxStale::Unbounded,
            stale_if_error: Some(600),
            ..Default::default()
        };
        assert_eq!(
            decide(&request, &stale("must-revalidate, stale-while-revalidate=60", 5)),
            Decision::Revalidate {
                stale_fallback: false
            }
        );
    }

    #[test]
    fn only_if_cached_serves_stale_on_error_budget() {
        let request = RequestCacheControl {
            only_if_cached: true,
            stale_if_error: Some(60),
            ..Default::default()
        };
        assert_eq!(
            decide(&request, &stale("max-age=1", 10)),
            Decision::ServeStaleOnError
        );
    }

    #[test]
    fn declared_lifetime_is_clamped_to_configured_ttl() {
        let now = Utc::now();
        let cc = ResponseCacheControl {
            max_age: Some(600),
            s_maxage: Some(300),
            ..Default::default()
        };
        let ttl = freshness_lifetime(&cc, &HeaderMap::new(), Duration::from_secs(120), now).unwrap();
        assert_eq!(ttl, Duration::from_secs(120));

        let ttl = freshness_lifetime(&cc, &HeaderMap::new(), Duration::from_secs(3600), now).unwrap();
        assert_eq!(ttl, Duration::from_secs(300), "s-maxage wins over max-age");

        let ttl = freshness_lifetime(
            &ResponseCacheControl::default(),
            &HeaderMap::new(),
            Duration::from_secs(120),
            now,
        )
        .unwrap();
        assert_eq!(ttl, Duration::from_secs(120));
    }

    #[test]
    fn freshness_is_monotonic_in_declared_ttl() {
        let now = Utc::now();
        let configured = Duration::from_secs(3600);
        let mut previous = Duration::ZERO;
        for max_age in [0_u64, 1, 30, 60, 600, 3600, 7200] {
            let cc = ResponseCacheControl {
                max_age: Some(max_age),
                ..Default::default()
            };
            let ttl = freshness_lifetime(&cc, &HeaderMap::new(), configured, now).unwrap();
            assert!(ttl >= previous, "ttl for max-age={max_age} went backwards");
            previous = ttl;
        }
    }

    #[test]
    fn malformed_dates_are_reported() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert(EXPIRES, HeaderValue::from_static("0"));
        let err = freshness_lifetime(
            &ResponseCacheControl::default(),
            &headers,
            Duration::from_secs(60),
            now,
        )
        .unwrap_err();
        assert_eq!(err.detail(), "MALFORMED-EXPIRES");

        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_static("not a date"));
        let err = freshness_lifetime(
            &ResponseCacheControl::default(),
            &headers,
            Duration::from_secs(60),
            now,
        )
        .unwrap_err();
        assert_eq!(err.detail(), "MALFORMED-DATE");
    }
}
