#![doc = include_str!("../README.md")]
// #![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Management endpoint.
///
/// [`ManagementApi`](api::ManagementApi) lists stored keys and surrogate tags,
/// and purges or invalidates entries by regex, tag or URI selector.
pub mod api;

/// The `Cache-Status` response header.
///
/// [`CacheStatus`](cache_status::CacheStatus) collects the outcome, remaining
/// ttl, key and detail codes of a request and renders them as one RFC 9211
/// list member.
pub mod cache_status;

/// Storability of origin responses.
pub mod cacheability;

/// Request coalescing.
///
/// Concurrent misses on the same key share a single origin fetch. See
/// [`Coalescer`](coalescing::Coalescer).
pub mod coalescing;

/// Cache configuration.
///
/// [`CacheConfig`] is plain serde data. It is validated into a
/// [`CompiledConfig`](config::CompiledConfig) when the pipeline is built.
pub mod config;

/// Error types for cache operations.
///
/// Defines [`CacheError`] which covers:
/// - Backend errors (storage failures)
/// - Upstream errors (origin failures with nothing stored to fall back on)
/// - Coalescing failures and invalid configuration
pub mod error;

/// Finite state machine driving one request through the cache.
pub mod fsm;

/// Metrics collection for cache observability.
///
/// When the `metrics` feature is enabled, this module records counters and
/// histograms for cache outcomes, origin latency and coalesced waits.
pub mod metrics;

/// Background task offloading for stale-while-revalidate refreshes.
pub mod offload;

/// Surrogate-key tag index.
pub mod surrogate;

pub use api::{Invalidation, InvalidationKind, ManagementApi};
pub use cache_status::{CACHE_STATUS, CacheStatus, Outcome};
pub use config::{CacheConfig, CacheMode, CompiledConfig};
pub use error::{BoxError, CacheError, UpstreamError};
pub use fsm::{CachePipeline, CachePipelineBuilder};
pub use offload::OffloadManager;
pub use surrogate::SurrogateIndex;

pub use stashbox_core::{CacheKey, KeyConfig, StoredResponse, Upstream};
