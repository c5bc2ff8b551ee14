//! Builder for configuring [`MokaStorage`].

use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::{Cache, CacheBuilder};
use moka::policy::EvictionPolicy;
use smol_str::SmolStr;
use stashbox_backend::{Compressor, PassthroughCompressor};

use crate::storage::{Entry, MokaStorage};

/// Expires every entry after the TTL it was written with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Expiration;

impl Expiry<String, Entry> for Expiration {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // The rewritten entry carries its own TTL, the old deadline is irrelevant.
        Some(value.ttl)
    }
}

/// Capacity has not been configured yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapacity;

/// At most `n` entries.
#[derive(Debug, Clone, Copy)]
pub struct EntryCapacity(pub(crate) u64);

/// At most `n` bytes of keys and values, approximately.
#[derive(Debug, Clone, Copy)]
pub struct ByteCapacity(pub(crate) u64);

/// Builder for [`MokaStorage`].
///
/// Capacity is mandatory and set exactly once, either with
/// [`max_entries`](Self::max_entries) or [`max_bytes`](Self::max_bytes);
/// `build()` only exists afterwards.
///
/// ```
/// use stashbox_moka::MokaStorage;
///
/// let storage = MokaStorage::builder()
///     .name("L1")
///     .max_bytes(64 * 1024 * 1024)
///     .build();
/// ```
pub struct MokaStorageBuilder<Cap, C = PassthroughCompressor>
where
    C: Compressor,
{
    capacity: Cap,
    compressor: C,
    name: SmolStr,
    eviction_policy: Option<EvictionPolicy>,
}

impl MokaStorageBuilder<NoCapacity, PassthroughCompressor> {
    pub fn new() -> Self {
        Self {
            capacity: NoCapacity,
            compressor: PassthroughCompressor,
            name: SmolStr::new_static("MOKA"),
            eviction_policy: None,
        }
    }
}

impl Default for MokaStorageBuilder<NoCapacity, PassthroughCompressor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Compressor> MokaStorageBuilder<NoCapacity, C> {
    pub fn max_entries(self, capacity: u64) -> MokaStorageBuilder<EntryCapacity, C> {
        MokaStorageBuilder {
            capacity: EntryCapacity(capacity),
            compressor: self.compressor,
            name: self.name,
            eviction_policy: self.eviction_policy,
        }
    }

    /// Bounds the cache by the summed length of keys and stored bytes.
    pub fn max_bytes(self, bytes: u64) -> MokaStorageBuilder<ByteCapacity, C> {
        MokaStorageBuilder {
            capacity: ByteCapacity(bytes),
            compressor: self.compressor,
            name: self.name,
            eviction_policy: self.eviction_policy,
        }
    }
}

impl<Cap, C: Compressor> MokaStorageBuilder<Cap, C> {
    /// Name reported in diagnostics, `MOKA` by default.
    pub fn name(mut self, name: impl Into<SmolStr>) -> Self {
        self.name = name.into();
        self
    }

    /// Defaults to TinyLFU for entry capacity and LRU for byte capacity.
    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    /// Compression of response blobs. Rarely worth it in memory.
    pub fn compressor<NewC: Compressor>(self, compressor: NewC) -> MokaStorageBuilder<Cap, NewC> {
        MokaStorageBuilder {
            capacity: self.capacity,
            compressor,
            name: self.name,
            eviction_policy: self.eviction_policy,
        }
    }
}

impl<C: Compressor> MokaStorageBuilder<EntryCapacity, C> {
    pub fn build(self) -> MokaStorage<C> {
        let policy = self.eviction_policy.unwrap_or_else(EvictionPolicy::tiny_lfu);
        let cache: Cache<String, Entry> = CacheBuilder::new(self.capacity.0)
            .eviction_policy(policy)
            .expire_after(Expiration)
            .build();
        MokaStorage::from_parts(cache, self.compressor, self.name)
    }
}

impl<C: Compressor> MokaStorageBuilder<ByteCapacity, C> {
    pub fn build(self) -> MokaStorage<C> {
        let policy = self.eviction_policy.unwrap_or_else(EvictionPolicy::lru);
        let cache: Cache<String, Entry> = CacheBuilder::new(self.capacity.0)
            .weigher(|key: &String, value: &Entry| -> u32 {
                (key.len() + value.data.len()).try_into().unwrap_or(u32::MAX)
            })
            .eviction_policy(policy)
            .expire_after(Expiration)
            .build();
        MokaStorage::from_parts(cache, self.compressor, self.name)
    }
}
