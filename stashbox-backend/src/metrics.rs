//! Storage metrics.
//!
//! Enable the `metrics` feature to record them through the `metrics` facade.
//! Every name follows `stashbox_storage_{operation}_{metric_type}` and carries
//! a `storage` label.

use std::time::Duration;

#[cfg(feature = "metrics")]
use std::time::Instant;

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

/// Timer that costs nothing when the `metrics` feature is disabled.
pub struct Timer {
    #[cfg(feature = "metrics")]
    start: Instant,
}

impl Timer {
    #[inline]
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "metrics")]
            start: Instant::now(),
        }
    }

    /// Elapsed time, `Duration::ZERO` without the `metrics` feature.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        #[cfg(feature = "metrics")]
        {
            self.start.elapsed()
        }
        #[cfg(not(feature = "metrics"))]
        {
            Duration::ZERO
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref STORAGE_READ_TOTAL: &'static str = {
        metrics::describe_counter!(
            "stashbox_storage_read_total",
            "Total number of lookups per storage."
        );
        "stashbox_storage_read_total"
    };

    pub static ref STORAGE_READ_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_storage_read_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of multi-level lookups in seconds."
        );
        "stashbox_storage_read_duration_seconds"
    };

    pub static ref STORAGE_READ_ERRORS: &'static str = {
        metrics::describe_counter!(
            "stashbox_storage_read_errors_total",
            "Total number of failed or timed out lookups per storage."
        );
        "stashbox_storage_read_errors_total"
    };

    pub static ref STORAGE_WRITE_TOTAL: &'static str = {
        metrics::describe_counter!(
            "stashbox_storage_write_total",
            "Total number of variant writes per storage."
        );
        "stashbox_storage_write_total"
    };

    pub static ref STORAGE_WRITE_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_storage_write_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of variant writes in seconds."
        );
        "stashbox_storage_write_duration_seconds"
    };

    pub static ref STORAGE_WRITE_ERRORS: &'static str = {
        metrics::describe_counter!(
            "stashbox_storage_write_errors_total",
            "Total number of failed variant writes per storage."
        );
        "stashbox_storage_write_errors_total"
    };

    pub static ref STORAGE_COMPRESS_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_storage_compress_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of blob compression in seconds."
        );
        "stashbox_storage_compress_duration_seconds"
    };

    pub static ref STORAGE_DECOMPRESS_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_storage_decompress_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of blob decompression in seconds."
        );
        "stashbox_storage_decompress_duration_seconds"
    };

    pub static ref STORAGE_SERIALIZE_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_storage_serialize_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of blob serialization in seconds."
        );
        "stashbox_storage_serialize_duration_seconds"
    };

    pub static ref STORAGE_DESERIALIZE_DURATION: &'static str = {
        metrics::describe_histogram!(
            "stashbox_storage_deserialize_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of blob deserialization in seconds."
        );
        "stashbox_storage_deserialize_duration_seconds"
    };
}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_read(storage: &str, duration: Duration) {
    metrics::counter!(*STORAGE_READ_TOTAL, "storage" => storage.to_string()).increment(1);
    metrics::histogram!(*STORAGE_READ_DURATION, "storage" => storage.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_read(_storage: &str, _duration: Duration) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_read_error(storage: &str) {
    metrics::counter!(*STORAGE_READ_ERRORS, "storage" => storage.to_string()).increment(1);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_read_error(_storage: &str) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_write(storage: &str, duration: Duration) {
    metrics::counter!(*STORAGE_WRITE_TOTAL, "storage" => storage.to_string()).increment(1);
    metrics::histogram!(*STORAGE_WRITE_DURATION, "storage" => storage.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_write(_storage: &str, _duration: Duration) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_write_error(storage: &str) {
    metrics::counter!(*STORAGE_WRITE_ERRORS, "storage" => storage.to_string()).increment(1);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_write_error(_storage: &str) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_compress(storage: &str, duration: Duration) {
    metrics::histogram!(*STORAGE_COMPRESS_DURATION, "storage" => storage.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_compress(_storage: &str, _duration: Duration) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_decompress(storage: &str, duration: Duration) {
    metrics::histogram!(*STORAGE_DECOMPRESS_DURATION, "storage" => storage.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_decompress(_storage: &str, _duration: Duration) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_serialize(storage: &str, duration: Duration) {
    metrics::histogram!(*STORAGE_SERIALIZE_DURATION, "storage" => storage.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_serialize(_storage: &str, _duration: Duration) {}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_deserialize(storage: &str, duration: Duration) {
    metrics::histogram!(*STORAGE_DESERIALIZE_DURATION, "storage" => storage.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_deserialize(_storage: &str, _duration: Duration) {}
