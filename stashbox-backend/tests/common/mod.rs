//! In-memory storages for tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use regex::Regex;
use stashbox_backend::{BackendError, BackendResult, DeleteStatus, Storage};

/// DashMap-backed storage honoring per-entry TTL.
#[derive(Clone)]
pub struct TestStorage {
    name: &'static str,
    store: Arc<DashMap<String, (Bytes, Instant)>>,
    writes: Arc<AtomicUsize>,
}

impl TestStorage {
    pub fn new() -> Self {
        Self::named("TEST")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            store: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.store
            .get(key)
            .is_some_and(|entry| entry.1 > Instant::now())
    }

    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.store.get(key).map(|entry| entry.0.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.store
            .get(key)
            .map(|entry| entry.1.saturating_duration_since(Instant::now()))
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }
}

impl Default for TestStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for TestStorage {
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        Ok(self
            .store
            .get(key)
            .filter(|entry| entry.1 > Instant::now())
            .map(|entry| entry.0.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> BackendResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.store
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<DeleteStatus> {
        Ok(match self.store.remove(key) {
            Some(_) => DeleteStatus::Deleted(1),
            None => DeleteStatus::Missing,
        })
    }

    async fn delete_many(&self, pattern: &Regex) -> BackendResult<DeleteStatus> {
        let before = self.store.len();
        self.store.retain(|key, _| !pattern.is_match(key));
        Ok(match before - self.store.len() {
            0 => DeleteStatus::Missing,
            count => DeleteStatus::Deleted(count as u32),
        })
    }

    async fn list_keys(&self) -> BackendResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .store
            .iter()
            .filter(|entry| entry.value().1 > now)
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn map_keys(&self, prefix: &str) -> BackendResult<BTreeMap<String, Bytes>> {
        let now = Instant::now();
        Ok(self
            .store
            .iter()
            .filter(|entry| entry.value().1 > now)
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(prefix)
                    .map(|stripped| (stripped.to_owned(), entry.value().0.clone()))
            })
            .collect())
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn reset(&self) -> BackendResult<()> {
        self.store.clear();
        Ok(())
    }
}

fn simulated() -> BackendError {
    BackendError::InternalError(Box::new(std::io::Error::other("simulated error")))
}

/// Storage that fails every operation.
#[derive(Clone, Default)]
pub struct ErrorStorage;

#[async_trait]
impl Storage for ErrorStorage {
    async fn get(&self, _key: &str) -> BackendResult<Option<Bytes>> {
        Err(simulated())
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> BackendResult<()> {
        Err(simulated())
    }

    async fn delete(&self, _key: &str) -> BackendResult<DeleteStatus> {
        Err(simulated())
    }

    async fn delete_many(&self, _pattern: &Regex) -> BackendResult<DeleteStatus> {
        Err(simulated())
    }

    async fn list_keys(&self) -> BackendResult<Vec<String>> {
        Err(simulated())
    }

    async fn map_keys(&self, _prefix: &str) -> BackendResult<BTreeMap<String, Bytes>> {
        Err(simulated())
    }

    fn name(&self) -> &str {
        "FAILING"
    }

    async fn reset(&self) -> BackendResult<()> {
        Err(simulated())
    }
}

/// Storage whose reads never finish in time.
#[derive(Clone)]
pub struct SlowStorage {
    pub inner: TestStorage,
    pub delay: Duration,
}

#[async_trait]
impl Storage for SlowStorage {
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> BackendResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> BackendResult<DeleteStatus> {
        self.inner.delete(key).await
    }

    async fn delete_many(&self, pattern: &Regex) -> BackendResult<DeleteStatus> {
        self.inner.delete_many(pattern).await
    }

    async fn list_keys(&self) -> BackendResult<Vec<String>> {
        self.inner.list_keys().await
    }

    async fn map_keys(&self, prefix: &str) -> BackendResult<BTreeMap<String, Bytes>> {
        self.inner.map_keys(prefix).await
    }

    fn name(&self) -> &str {
        "SLOW"
    }

    async fn reset(&self) -> BackendResult<()> {
        self.inner.reset().await
    }
}

/// Builds the write of a `200 OK` response varying on `Accept`.
pub fn accept_variant(
    base: &str,
    accept: &str,
    body: &'static str,
    ttl: Duration,
    stale: Duration,
    now: chrono::DateTime<chrono::Utc>,
) -> stashbox_backend::VariantWrite {
    use http::header::{ACCEPT, ETAG, VARY};
    use stashbox_core::{CacheKey, StoredResponse, Vary, VariedKey};

    let base = CacheKey::from(base);
    let mut request = http::HeaderMap::new();
    request.insert(ACCEPT, accept.parse().unwrap());

    let mut headers = http::HeaderMap::new();
    headers.insert(VARY, "Accept".parse().unwrap());
    headers.insert(ETAG, format!("\"{body}\"").parse().unwrap());
    let (varied_key, varied_headers) =
        VariedKey::compute(&base, &Vary::from_headers(&headers), &request);

    stashbox_backend::VariantWrite {
        base,
        real_key: varied_key.into_string(),
        varied_headers,
        response: StoredResponse::new(http::StatusCode::OK, headers, Bytes::from_static(body.as_bytes())),
        ttl,
        stale,
        now,
    }
}

pub fn accept_request(accept: &str) -> http::HeaderMap {
    let mut request = http::HeaderMap::new();
    request.insert(http::header::ACCEPT, accept.parse().unwrap());
    request
}
