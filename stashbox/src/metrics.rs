//! Metrics declaration and recording helpers.
//!
//! Every helper compiles to nothing without the `metrics` feature.

use std::time::Duration;

use crate::cache_status::Outcome;

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    /// Requests answered from storage.
    pub static ref CACHE_HIT_COUNTER: &'static str = {
        metrics::describe_counter!(
            "stashbox_cache_hit_total",
            "Total number of requests answered from storage."
        );
        "stashbox_cache_hit_total"
    };
    /// Requests forwarded because nothing usable was stored.
    pub static ref CACHE_MISS_COUNTER: &'static str = {
        metrics::describe_counter!(
            "stashbox_cache_miss_total",
            "Total number of requests forwarded to the origin on a miss."
        );
        "stashbox_cache_miss_total"
    };
    /// Requests answered with a stale entry.
    pub static ref CACHE_STALE_COUNTER: &'static str = {
        metrics::describe_counter!(
            "stashbox_cache_stale_total",
            "Total number of requests answered with a stale entry."
        );
        "stashbox_cache_stale_total"
    };
    /// Requests that skipped the cache entirely.
    pub static ref CACHE_BYPASS_COUNTER: &'static str = {
        metrics::describe_counter!(
            "stashbox_cache_bypass_total",
            "Total number of requests that bypassed the cache."
        );
        "stashbox_cache_bypass_total"
    };
    /// Requests revalidated with the origin.
    pub static ref CACHE_REVALIDATE_COUNTER: &'static str = {
        metrics::describe_counter!(
            "stashbox_cache_revalidate_total",
            "Total number of requests revalidated with the origin."
        );
        "stashbox_cache_revalidate_total"
    };

    /// Callers that waited on another caller's origin fetch.
    pub static ref COALESCED_WAITS: &'static str = {
        metrics::describe_counter!(
            "stashbox_coalesced_waits_total",
            "Total number of callers served by a coalesced origin fetch."
        );
        "stashbox_coalesced_waits_total"
    };

    /// Histogram of cache request duration.
    pub static ref CACHE_REQUEST_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_request_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of cache requests in seconds."
        );
        "stashbox_request_duration_seconds"
    };
    /// Histogram of origin round-trips.
    pub static ref CACHE_UPSTREAM_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_upstream_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of upstream requests in seconds."
        );
        "stashbox_upstream_duration_seconds"
    };

    /// Background refreshes started.
    pub static ref REFRESH_SPAWNED: &'static str = {
        metrics::describe_counter!(
            "stashbox_refresh_spawned_total",
            "Total number of background revalidations started."
        );
        "stashbox_refresh_spawned_total"
    };
    /// Background refreshes skipped, already running or over the bound.
    pub static ref REFRESH_SKIPPED: &'static str = {
        metrics::describe_counter!(
            "stashbox_refresh_skipped_total",
            "Total number of background revalidations that were not started."
        );
        "stashbox_refresh_skipped_total"
    };
    /// Background refreshes that ran to completion.
    pub static ref REFRESH_COMPLETED: &'static str = {
        metrics::describe_counter!(
            "stashbox_refresh_completed_total",
            "Total number of background revalidations completed."
        );
        "stashbox_refresh_completed_total"
    };
    /// Background refreshes cancelled by their timeout.
    pub static ref REFRESH_TIMEOUT: &'static str = {
        metrics::describe_counter!(
            "stashbox_refresh_timeout_total",
            "Total number of background revalidations cancelled by their timeout."
        );
        "stashbox_refresh_timeout_total"
    };
    /// Background refreshes currently running.
    pub static ref REFRESH_ACTIVE: &'static str = {
        metrics::describe_gauge!(
            "stashbox_refresh_active",
            "Number of background revalidations currently running."
        );
        "stashbox_refresh_active"
    };
    pub static ref REFRESH_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_refresh_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of background revalidations in seconds."
        );
        "stashbox_refresh_duration_seconds"
    };
}

/// Records the outcome of one request.
///
/// `storage` names the storage a hit came from, empty otherwise.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_outcome(outcome: Outcome, storage: &str, duration: Duration) {
    let counter = match outcome {
        Outcome::Hit => *CACHE_HIT_COUNTER,
        Outcome::UriMiss => *CACHE_MISS_COUNTER,
        Outcome::Stale => *CACHE_STALE_COUNTER,
        Outcome::Bypass => *CACHE_BYPASS_COUNTER,
        Outcome::Request => *CACHE_REVALIDATE_COUNTER,
    };
    metrics::counter!(counter, "storage" => storage.to_string()).increment(1);
    metrics::histogram!(*CACHE_REQUEST_DURATION, "outcome" => outcome.as_str())
        .record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_outcome(_outcome: Outcome, _storage: &str, _duration: Duration) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_upstream(duration: Duration) {
    metrics::histogram!(*CACHE_UPSTREAM_DURATION).record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_upstream(_duration: Duration) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_coalesced_wait() {
    metrics::counter!(*COALESCED_WAITS).increment(1);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_coalesced_wait() {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_refresh_spawned() {
    metrics::counter!(*REFRESH_SPAWNED).increment(1);
    metrics::gauge!(*REFRESH_ACTIVE).increment(1.0);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_refresh_spawned() {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_refresh_skipped() {
    metrics::counter!(*REFRESH_SKIPPED).increment(1);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_refresh_skipped() {}

/// Records the end of a background refresh, `completed` is false when its
/// timeout cancelled it.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_refresh_finished(duration: Duration, completed: bool) {
    let counter = if completed {
        *REFRESH_COMPLETED
    } else {
        *REFRESH_TIMEOUT
    };
    metrics::counter!(counter).increment(1);
    metrics::gauge!(*REFRESH_ACTIVE).decrement(1.0);
    metrics::histogram!(*REFRESH_DURATION).record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_refresh_finished(_duration: Duration, _completed: bool) {}
