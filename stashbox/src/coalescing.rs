//! Request coalescing.
//!
//! At most one origin fetch per cache key is in flight. The first caller
//! becomes the leader and runs the fetch, every caller arriving meanwhile
//! subscribes to the leader's broadcast and receives a clone of its result.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stashbox_core::CacheKey;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::config::{CoalescingConfig, CoalescingMode};
use crate::error::CoalescingError;
use crate::metrics;

type InFlight<T> = Arc<DashMap<CacheKey, broadcast::Sender<T>>>;

/// Deduplicates concurrent fetches of the same key.
#[derive(Debug)]
pub struct Coalescer<T> {
    in_flight: InFlight<T>,
    config: CoalescingConfig,
}

impl<T> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            in_flight: self.in_flight.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(config: CoalescingConfig) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Number of keys with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Runs `fetch` unless a fetch for `key` is already in flight, in which
    /// case the result of that fetch is awaited instead.
    ///
    /// In [`CoalescingMode::Detached`] the fetch runs on its own task and
    /// completes even if every caller is dropped. In
    /// [`CoalescingMode::FollowCaller`] dropping the leader cancels the fetch
    /// and its waiters get [`CoalescingError::Abandoned`].
    pub async fn run<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<T, CoalescingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if !self.config.enabled {
            return Ok(fetch().await);
        }

        let waiting = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(leader) => Some(leader.get().subscribe()),
            Entry::Vacant(slot) => {
                let (sender, _) = broadcast::channel(1);
                slot.insert(sender);
                None
            }
        };

        if let Some(mut receiver) = waiting {
            trace!(key = %key, "awaiting in-flight fetch");
            metrics::record_coalesced_wait();
            return match tokio::time::timeout(self.config.timeout, receiver.recv()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(CoalescingError::Abandoned),
                Err(_) => {
                    debug!(key = %key, timeout = ?self.config.timeout, "coalesced wait timed out");
                    Err(CoalescingError::Timeout(self.config.timeout))
                }
            };
        }

        let leader = Leader {
            in_flight: self.in_flight.clone(),
            key: Some(key.clone()),
        };
        let future = fetch();
        match self.config.mode {
            CoalescingMode::FollowCaller => {
                let value = future.await;
                leader.complete(value.clone());
                Ok(value)
            }
            CoalescingMode::Detached => {
                let task = tokio::spawn(async move {
                    let value = future.await;
                    leader.complete(value.clone());
                    value
                });
                task.await.map_err(|error| {
                    debug!(key = %key, error = ?error, "coalesced fetch task failed");
                    CoalescingError::Abandoned
                })
            }
        }
    }
}

/// Owns the in-flight slot of a key until the fetch completes.
///
/// Dropping it without completing releases the slot, which closes the
/// channel and wakes every waiter with an error.
struct Leader<T> {
    in_flight: InFlight<T>,
    key: Option<CacheKey>,
}

impl<T> Leader<T> {
    fn complete(mut self, value: T) {
        if let Some(key) = self.key.take() {
            if let Some((_, sender)) = self.in_flight.remove(&key) {
                // No receivers just means nobody was waiting.
                let _ = sender.send(value);
            }
        }
    }
}

impl<T> Drop for Leader<T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.in_flight.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn coalescer(mode: CoalescingMode, timeout: Duration) -> Coalescer<usize> {
        Coalescer::new(CoalescingConfig {
            enabled: true,
            mode,
            timeout,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_fetch() {
        let coalescer = coalescer(CoalescingMode::Detached, Duration::from_secs(5));
        let counter = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from("GET-example.com-/");

        let callers = (0..16).map(|_| {
            let coalescer = coalescer.clone();
            let counter = counter.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coalescer
                    .run(&key, move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        counter.fetch_add(1, Ordering::SeqCst) + 1
                    })
                    .await
            })
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1, "fetch must run exactly once");
        for result in results {
            assert_eq!(result.unwrap(), Ok(1), "every caller observes the leader's result");
        }
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiter_times_out() {
        let coalescer = coalescer(CoalescingMode::Detached, Duration::from_millis(20));
        let key = CacheKey::from("slow");

        let leader = {
            let coalescer = coalescer.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coalescer
                    .run(&key, || async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        7
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let waited = coalescer.run(&key, || async { 0 }).await;
        assert_eq!(waited, Err(CoalescingError::Timeout(Duration::from_millis(20))));
        assert_eq!(leader.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn dropped_leader_abandons_waiters_when_following_the_caller() {
        let coalescer = coalescer(CoalescingMode::FollowCaller, Duration::from_secs(5));
        let key = CacheKey::from("cancelled");

        let leader = {
            let coalescer = coalescer.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coalescer
                    .run(&key, || async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let waiter = {
            let coalescer = coalescer.clone();
            let key = key.clone();
            tokio::spawn(async move { coalescer.run(&key, || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        leader.abort();

        assert_eq!(waiter.await.unwrap(), Err(CoalescingError::Abandoned));
        assert_eq!(coalescer.in_flight(), 0, "the slot is released with the leader");
    }

    #[tokio::test]
    async fn detached_fetch_survives_its_leader() {
        let coalescer = coalescer(CoalescingMode::Detached, Duration::from_secs(5));
        let counter = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from("detached");

        let leader = {
            let coalescer = coalescer.clone();
            let counter = counter.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coalescer
                    .run(&key, move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        leader.abort();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1, "fetch ran to completion");
    }
}
