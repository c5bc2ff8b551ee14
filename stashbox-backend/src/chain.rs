//! Ordered set of storages acting as one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use http::HeaderMap;
use regex::Regex;
use smol_str::SmolStr;
use stashbox_core::{CacheKey, Lookup, Revalidator};

use crate::locks::KeyLocks;
use crate::metrics::{self, Timer};
use crate::multi_level::{MultiLevelStorage, VariantWrite};
use crate::{BackendError, BackendResult, DeleteStatus, Storage};

/// Default bound on a single storage lookup.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a fan-out write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// Storages that accepted the write.
    pub stored: Vec<SmolStr>,
    /// Storages that failed, in chain order.
    pub failed: Vec<SmolStr>,
}

impl StoreReport {
    /// At least one storage accepted the write.
    pub fn is_stored(&self) -> bool {
        !self.stored.is_empty()
    }
}

/// Storages consulted in order.
///
/// Reads return the first storage with a usable entry, a storage that fails
/// or exceeds the read timeout counts as a miss. Writes fan out to every
/// storage in parallel and succeed when at least one storage accepts them.
///
/// Writes of the same base key are serialized inside one chain, so mapping
/// read-modify-write cycles never interleave.
#[derive(Clone)]
pub struct StorageChain {
    storages: Arc<[Arc<dyn Storage>]>,
    locks: KeyLocks,
    read_timeout: Duration,
}

impl std::fmt::Debug for StorageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageChain")
            .field("storages", &self.names())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl StorageChain {
    pub fn new(storages: Vec<Arc<dyn Storage>>) -> Self {
        Self {
            storages: storages.into(),
            locks: KeyLocks::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn storages(&self) -> &[Arc<dyn Storage>] {
        &self.storages
    }

    pub fn names(&self) -> Vec<&str> {
        self.storages.iter().map(|storage| storage.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Multi-level lookup across the chain.
    ///
    /// `revalidator` ends up validated against the entry that was returned.
    #[tracing::instrument(skip(self, request, revalidator), fields(key = %base), level = "trace")]
    pub async fn lookup(
        &self,
        base: &CacheKey,
        request: &HeaderMap,
        revalidator: &mut Revalidator,
        now: DateTime<Utc>,
    ) -> Lookup {
        for storage in self.storages.iter() {
            let mut attempt = revalidator.clone();
            let timer = Timer::new();
            let result = tokio::time::timeout(
                self.read_timeout,
                storage.get_multi_level(base, request, &mut attempt, now),
            )
            .await;
            metrics::record_read(storage.name(), timer.elapsed());

            match result {
                Ok(Ok(lookup)) if !lookup.is_empty() => {
                    *revalidator = attempt;
                    return lookup;
                }
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    metrics::record_read_error(storage.name());
                    tracing::warn!(backend = storage.name(), error = ?error, "storage lookup failed");
                }
                Err(_) => {
                    metrics::record_read_error(storage.name());
                    let error = BackendError::Timeout {
                        storage: storage.name().to_owned(),
                        timeout: self.read_timeout,
                    };
                    tracing::warn!(backend = storage.name(), error = ?error, "storage lookup timed out");
                }
            }
        }
        Lookup::default()
    }

    /// Stores one representation in every storage.
    #[tracing::instrument(skip(self, write), fields(key = %write.base), level = "trace")]
    pub async fn store(&self, write: &VariantWrite) -> StoreReport {
        let _guard = self.locks.lock(&write.base.mapping_key()).await;
        let results = join_all(self.storages.iter().map(|storage| async move {
            let timer = Timer::new();
            let result = storage.set_multi_level(write).await;
            metrics::record_write(storage.name(), timer.elapsed());
            (storage.name(), result)
        }))
        .await;
        self.report(results)
    }

    /// Writes a raw entry to every storage.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StoreReport {
        let results = join_all(self.storages.iter().map(|storage| {
            let value = value.clone();
            async move { (storage.name(), storage.set(key, value, ttl).await) }
        }))
        .await;
        self.report(results)
    }

    fn report(&self, results: Vec<(&str, BackendResult<()>)>) -> StoreReport {
        let mut report = StoreReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.stored.push(name.into()),
                Err(error) => {
                    metrics::record_write_error(name);
                    tracing::warn!(backend = name, error = ?error, "storage write failed");
                    report.failed.push(name.into());
                }
            }
        }
        report
    }

    /// First raw value found for `key`.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        for storage in self.storages.iter() {
            match tokio::time::timeout(self.read_timeout, storage.get(key)).await {
                Ok(Ok(Some(value))) => return Some(value),
                Ok(Ok(None)) => {}
                Ok(Err(error)) => {
                    tracing::warn!(backend = storage.name(), error = ?error, "storage read failed")
                }
                Err(_) => tracing::warn!(backend = storage.name(), "storage read timed out"),
            }
        }
        None
    }

    /// Serializes read-modify-write cycles of raw entries under `key`.
    pub async fn lock(&self, key: &str) -> crate::locks::KeyLockGuard {
        self.locks.lock(key).await
    }

    pub async fn delete(&self, key: &str) -> DeleteStatus {
        let results = join_all(self.storages.iter().map(|storage| storage.delete(key))).await;
        self.merge_deletes(results)
    }

    pub async fn delete_many(&self, pattern: &Regex) -> DeleteStatus {
        let results =
            join_all(self.storages.iter().map(|storage| storage.delete_many(pattern))).await;
        self.merge_deletes(results)
    }

    fn merge_deletes(&self, results: Vec<BackendResult<DeleteStatus>>) -> DeleteStatus {
        results
            .into_iter()
            .zip(self.storages.iter())
            .fold(DeleteStatus::Missing, |acc, (result, storage)| match result {
                Ok(status) => acc.merge(status),
                Err(error) => {
                    tracing::warn!(backend = storage.name(), error = ?error, "storage delete failed");
                    acc
                }
            })
    }

    /// Union of the keys of every storage, sorted.
    pub async fn list_keys(&self) -> Vec<String> {
        let mut keys = BTreeSet::new();
        for storage in self.storages.iter() {
            match storage.list_keys().await {
                Ok(listed) => keys.extend(listed),
                Err(error) => {
                    tracing::warn!(backend = storage.name(), error = ?error, "storage listing failed")
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Prefixed entries of every storage, earlier storages win on conflicts.
    pub async fn map_keys(&self, prefix: &str) -> BTreeMap<String, Bytes> {
        let mut entries = BTreeMap::new();
        for storage in self.storages.iter() {
            match storage.map_keys(prefix).await {
                Ok(mapped) => {
                    for (key, value) in mapped {
                        entries.entry(key).or_insert(value);
                    }
                }
                Err(error) => {
                    tracing::warn!(backend = storage.name(), error = ?error, "storage listing failed")
                }
            }
        }
        entries
    }

    /// Invalidates every representation of `base` in every storage.
    ///
    /// See [`MultiLevelStorage::invalidate_multi_level`]. Returns the largest
    /// number of variants affected in a single storage.
    pub async fn invalidate(&self, base: &CacheKey, purge: bool, now: DateTime<Utc>) -> usize {
        let _guard = self.locks.lock(&base.mapping_key()).await;
        let results = join_all(
            self.storages
                .iter()
                .map(|storage| storage.invalidate_multi_level(base, purge, now)),
        )
        .await;
        results
            .into_iter()
            .zip(self.storages.iter())
            .fold(0, |acc, (result, storage)| match result {
                Ok(count) => acc.max(count),
                Err(error) => {
                    tracing::warn!(backend = storage.name(), key = %base, error = ?error, "invalidation failed");
                    acc
                }
            })
    }

    /// Garbage-collects mappings in every storage.
    pub async fn purge_expired_mappings(&self, now: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        for storage in self.storages.iter() {
            match storage.purge_expired_mappings(now).await {
                Ok(count) => dropped += count,
                Err(error) => {
                    tracing::warn!(backend = storage.name(), error = ?error, "mapping purge failed")
                }
            }
        }
        dropped
    }

    /// Resets every storage, reporting the first failure after trying all.
    pub async fn reset(&self) -> BackendResult<()> {
        let results = join_all(self.storages.iter().map(|storage| storage.reset())).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}
