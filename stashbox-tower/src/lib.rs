//! Tower middleware integration for the stashbox HTTP cache.
//!
//! This crate provides [`Cache`], a Tower [`Layer`] that puts a
//! [`CachePipeline`](stashbox::CachePipeline) in front of any HTTP service.
//! The pipeline decides per request whether to answer from storage, revalidate
//! or forward, and the wrapped service is only called for the latter two.
//!
//! # Buffering
//!
//! Request and response bodies are collected in full before they enter the
//! pipeline, since stored entries are plain bytes. The wrapped service
//! therefore receives a `Request<Full<Bytes>>`, and the cached service answers
//! with a `Response<Full<Bytes>>`.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use stashbox::CacheConfig;
//! use stashbox_moka::MokaStorage;
//! use stashbox_tower::Cache;
//! use tower::{ServiceBuilder, service_fn};
//!
//! let cache = Cache::builder()
//!     .config(CacheConfig::builder().ttl(Duration::from_secs(60)).build())
//!     .storage(MokaStorage::builder().max_entries(1_000).build())
//!     .build()?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(cache)
//!     .service(service_fn(|_req| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(Full::new(Bytes::from("Hello"))))
//!     }));
//! ```
//!
//! # Response Headers
//!
//! Every response carries an RFC 9211 `Cache-Status` header, for example
//! `Stashbox; hit; ttl=42; key=GET-example.com-/` or
//! `Stashbox; fwd=uri-miss; fwd-status=200; stored`.
//!
//! # Errors
//!
//! The service error is a [`BoxError`](stashbox::BoxError). When the origin
//! fails and nothing stored can stand in, the origin's own error is returned
//! unchanged.
//!
//! # Main Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Cache`] | Tower `Layer`, the main entry point |
//! | [`CacheBuilder`] | Fluent builder for the layer |
//! | [`CacheService`] | The Tower `Service` that performs caching |
//! | [`ManagementService`] | The management API as a standalone service |
//! | [`TowerUpstream`] | Adapter bridging Tower services to the pipeline |
//!
//! [`Layer`]: tower::Layer

pub mod api;
pub mod future;
pub mod layer;
pub mod service;
pub mod upstream;

pub use api::ManagementService;
pub use layer::{Cache, CacheBuilder};
pub use service::CacheService;
pub use upstream::TowerUpstream;

pub use stashbox::{CacheConfig, CacheStatus};
