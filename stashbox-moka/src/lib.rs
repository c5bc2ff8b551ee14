#![doc = include_str!("../README.md")]

mod builder;
pub mod metrics;
mod storage;

use std::sync::Arc;

use stashbox_backend::{Storage, StorageRegistry};

pub use builder::{ByteCapacity, EntryCapacity, MokaStorageBuilder, NoCapacity};
pub use moka::policy::EvictionPolicy;
pub use storage::MokaStorage;

/// Registry kind of [`MokaStorage`].
pub const KIND: &str = "moka";

/// Registers the `moka` kind on `registry`.
pub fn register(registry: &StorageRegistry) {
    registry.register(KIND, |config| {
        Ok(Arc::new(MokaStorage::from_config(config)?) as Arc<dyn Storage>)
    });
}
