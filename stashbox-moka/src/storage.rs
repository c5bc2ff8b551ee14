use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use regex::Regex;
use smol_str::SmolStr;
use stashbox_backend::{
    BackendResult, Compressor, DeleteStatus, PassthroughCompressor, Storage, StorageConfig,
};

use crate::builder::{MokaStorageBuilder, NoCapacity};
use crate::metrics;

#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub(crate) data: Bytes,
    pub(crate) ttl: Duration,
}

/// In-memory storage powered by Moka.
///
/// Entries expire after the TTL given to [`Storage::set`]. Expiration is
/// best effort: listing may briefly show entries until Moka's housekeeping
/// runs, reads never return them.
#[derive(Clone)]
pub struct MokaStorage<C = PassthroughCompressor>
where
    C: Compressor,
{
    cache: Cache<String, Entry>,
    compressor: Arc<C>,
    name: SmolStr,
}

impl<C: Compressor> std::fmt::Debug for MokaStorage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStorage")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .field("compressor", &self.compressor.name())
            .finish()
    }
}

impl MokaStorage<PassthroughCompressor> {
    pub fn builder() -> MokaStorageBuilder<NoCapacity, PassthroughCompressor> {
        MokaStorageBuilder::new()
    }

    /// Builds a storage from registry configuration.
    ///
    /// Reads the `capacity` (entries) or `max_bytes` option, 10 000 entries
    /// when neither is set.
    pub fn from_config(config: &StorageConfig) -> BackendResult<Self> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| SmolStr::new_static("MOKA"));
        let builder = MokaStorage::builder().name(name);
        Ok(match config.option::<u64>("max_bytes")? {
            Some(bytes) => builder.max_bytes(bytes).build(),
            None => builder
                .max_entries(config.option::<u64>("capacity")?.unwrap_or(DEFAULT_CAPACITY))
                .build(),
        })
    }
}

const DEFAULT_CAPACITY: u64 = 10_000;

impl<C: Compressor> MokaStorage<C> {
    pub(crate) fn from_parts(cache: Cache<String, Entry>, compressor: C, name: SmolStr) -> Self {
        Self {
            cache,
            compressor: Arc::new(compressor),
            name,
        }
    }

    /// Runs Moka's pending housekeeping, evictions included.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    fn record_capacity(&self) {
        metrics::record_capacity(&self.name, self.cache.entry_count(), self.cache.weighted_size());
    }
}

#[async_trait]
impl<C> Storage for MokaStorage<C>
where
    C: Compressor + 'static,
{
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        Ok(self.cache.get(key).await.map(|entry| entry.data))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> BackendResult<()> {
        self.cache
            .insert(key.to_owned(), Entry { data: value, ttl })
            .await;
        self.record_capacity();
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<DeleteStatus> {
        Ok(match self.cache.remove(key).await {
            Some(_) => DeleteStatus::Deleted(1),
            None => DeleteStatus::Missing,
        })
    }

    async fn delete_many(&self, pattern: &Regex) -> BackendResult<DeleteStatus> {
        let matching: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| pattern.is_match(key))
            .map(|(key, _)| key)
            .collect();
        let mut deleted = 0;
        for key in matching {
            if self.cache.remove(key.as_str()).await.is_some() {
                deleted += 1;
            }
        }
        tracing::debug!(storage = %self.name, deleted, pattern = %pattern, "bulk delete");
        Ok(match deleted {
            0 => DeleteStatus::Missing,
            count => DeleteStatus::Deleted(count),
        })
    }

    async fn list_keys(&self) -> BackendResult<Vec<String>> {
        Ok(self.cache.iter().map(|(key, _)| key.as_ref().clone()).collect())
    }

    async fn map_keys(&self, prefix: &str) -> BackendResult<BTreeMap<String, Bytes>> {
        Ok(self
            .cache
            .iter()
            .filter_map(|(key, entry)| {
                key.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_owned(), entry.data))
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn reset(&self) -> BackendResult<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        self.record_capacity();
        Ok(())
    }

    fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }
}
