//! Background task execution.
//!
//! Stale-while-revalidate answers the client with the stale entry and
//! refreshes it here, outside the request. Refreshes are keyed by
//! [`CacheKey`] so one resource is never refreshed twice at once.
//!
//! ```ignore
//! use stashbox::offload::{OffloadConfig, OffloadManager};
//!
//! let manager = OffloadManager::new(OffloadConfig::builder().timeout(Duration::from_secs(30)).build());
//! manager.spawn_refresh(key.clone(), async move { refresh(key).await });
//! ```
//!
//! [`CacheKey`]: stashbox_core::CacheKey

mod manager;
mod policy;

pub use manager::OffloadManager;
pub use policy::{OffloadConfig, OffloadConfigBuilder, TimeoutPolicy};
