use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;

use crate::{BackendError, Compressor, DeleteStatus, PassthroughCompressor};

pub type BackendResult<T> = Result<T, BackendError>;

/// Key/value contract every cache storage implements.
///
/// Keys are opaque strings. The mapping store and the tag index are built on
/// top of this contract, so a storage never has to understand HTTP.
#[async_trait]
pub trait Storage: Sync + Send {
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>>;

    /// Stores `value` under `key`, the entry expires after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> BackendResult<()>;

    async fn delete(&self, key: &str) -> BackendResult<DeleteStatus>;

    /// Removes every key matching `pattern`.
    async fn delete_many(&self, pattern: &Regex) -> BackendResult<DeleteStatus>;

    /// Every live key, internal namespaces included.
    async fn list_keys(&self) -> BackendResult<Vec<String>>;

    /// Entries whose key starts with `prefix`, keyed by the key without the prefix.
    async fn map_keys(&self, prefix: &str) -> BackendResult<BTreeMap<String, Bytes>>;

    /// Name used in diagnostics, for instance `MOKA` in `MOKA-INSERTION-ERROR`.
    fn name(&self) -> &str {
        "storage"
    }

    /// Called once before the storage serves traffic.
    async fn init(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Drops every entry.
    async fn reset(&self) -> BackendResult<()>;

    fn compressor(&self) -> &dyn Compressor {
        &PassthroughCompressor
    }
}

macro_rules! forward_storage {
    ($ty:ty) => {
        #[async_trait]
        impl Storage for $ty {
            async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
                (**self).get(key).await
            }

            async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> BackendResult<()> {
                (**self).set(key, value, ttl).await
            }

            async fn delete(&self, key: &str) -> BackendResult<DeleteStatus> {
                (**self).delete(key).await
            }

            async fn delete_many(&self, pattern: &Regex) -> BackendResult<DeleteStatus> {
                (**self).delete_many(pattern).await
            }

            async fn list_keys(&self) -> BackendResult<Vec<String>> {
                (**self).list_keys().await
            }

            async fn map_keys(&self, prefix: &str) -> BackendResult<BTreeMap<String, Bytes>> {
                (**self).map_keys(prefix).await
            }

            fn name(&self) -> &str {
                (**self).name()
            }

            async fn init(&self) -> BackendResult<()> {
                (**self).init().await
            }

            async fn reset(&self) -> BackendResult<()> {
                (**self).reset().await
            }

            fn compressor(&self) -> &dyn Compressor {
                (**self).compressor()
            }
        }
    };
}

forward_storage!(&dyn Storage);
forward_storage!(Box<dyn Storage>);
forward_storage!(Arc<dyn Storage>);
