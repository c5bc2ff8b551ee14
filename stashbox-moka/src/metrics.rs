//! Moka storage capacity metrics.
//!
//! - `stashbox_moka_entries`: current number of entries (gauge)
//! - `stashbox_moka_size_bytes`: current weighted size (gauge)
//!
//! Both carry a `storage` label.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref MOKA_ENTRIES: &'static str = {
        metrics::describe_gauge!(
            "stashbox_moka_entries",
            "Current number of entries in the Moka storage."
        );
        "stashbox_moka_entries"
    };

    pub static ref MOKA_SIZE_BYTES: &'static str = {
        metrics::describe_gauge!(
            "stashbox_moka_size_bytes",
            "Current weighted size of the Moka storage."
        );
        "stashbox_moka_size_bytes"
    };
}

#[cfg(feature = "metrics")]
#[inline]
pub fn record_capacity(storage: &str, entries: u64, size: u64) {
    metrics::gauge!(*MOKA_ENTRIES, "storage" => storage.to_string()).set(entries as f64);
    metrics::gauge!(*MOKA_SIZE_BYTES, "storage" => storage.to_string()).set(size as f64);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_capacity(_storage: &str, _entries: u64, _size: u64) {}
