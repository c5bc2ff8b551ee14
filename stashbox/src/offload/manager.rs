use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stashbox_core::CacheKey;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use super::policy::{OffloadConfig, TimeoutPolicy};
use crate::metrics;

#[derive(Debug, Default)]
struct Refreshes {
    config: OffloadConfig,
    running: DashMap<CacheKey, JoinHandle<()>>,
}

/// Runs stale-while-revalidate refreshes outside the request.
///
/// At most one refresh per [`CacheKey`] runs at a time. Clones share the same
/// task table.
#[derive(Clone, Debug, Default)]
pub struct OffloadManager {
    inner: Arc<Refreshes>,
}

impl OffloadManager {
    pub fn new(config: OffloadConfig) -> Self {
        Self {
            inner: Arc::new(Refreshes {
                config,
                running: DashMap::new(),
            }),
        }
    }

    /// Spawns the refresh of `key`.
    ///
    /// Returns `false` when the refresh was skipped, either because one is
    /// already running for `key` or because the concurrency bound is reached.
    pub fn spawn_refresh<F>(&self, key: CacheKey, refresh: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(max) = self.inner.config.max_concurrent_tasks {
            if self.active_count() >= max {
                warn!(key = %key, max, "refresh skipped, concurrency bound reached");
                metrics::record_refresh_skipped();
                return false;
            }
        }

        match self.inner.running.entry(key) {
            Entry::Occupied(running) if !running.get().is_finished() => {
                debug!(key = %running.key(), "refresh already running");
                metrics::record_refresh_skipped();
                false
            }
            Entry::Occupied(mut finished) => {
                let handle = self.spawn_task(finished.key().clone(), refresh);
                finished.insert(handle);
                true
            }
            Entry::Vacant(slot) => {
                let handle = self.spawn_task(slot.key().clone(), refresh);
                slot.insert(handle);
                true
            }
        }
    }

    /// Whether a refresh of `key` is running.
    pub fn is_refreshing(&self, key: &CacheKey) -> bool {
        self.inner
            .running
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .running
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Waits until every running refresh has finished.
    pub async fn wait_all(&self) {
        loop {
            self.inner.running.retain(|_, handle| !handle.is_finished());
            if self.inner.running.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    fn spawn_task<F>(&self, key: CacheKey, refresh: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let policy = self.inner.config.timeout_policy;
        let inner = self.inner.clone();
        let span = info_span!("stashbox.refresh", key = %key);
        metrics::record_refresh_spawned();

        tokio::spawn(
            async move {
                let start = Instant::now();
                let completed = match policy {
                    TimeoutPolicy::None => {
                        refresh.await;
                        true
                    }
                    TimeoutPolicy::Cancel(limit) => {
                        let finished = tokio::time::timeout(limit, refresh).await.is_ok();
                        if !finished {
                            warn!(key = %key, limit = ?limit, "refresh cancelled by its timeout");
                        }
                        finished
                    }
                    TimeoutPolicy::Warn(limit) => {
                        refresh.await;
                        if start.elapsed() > limit {
                            warn!(
                                key = %key,
                                elapsed = ?start.elapsed(),
                                limit = ?limit,
                                "refresh ran past its timeout"
                            );
                        }
                        true
                    }
                };
                inner.running.remove(&key);
                metrics::record_refresh_finished(start.elapsed(), completed);
            }
            .instrument(span),
        )
    }
}
