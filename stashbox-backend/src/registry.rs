//! Storage construction from configuration.
//!
//! A [`StorageRegistry`] knows how to build each storage kind and keeps the
//! instances it built, so engines configured with the same storage name share
//! one instance. The registry is an ordinary value, owners decide how long it
//! lives and when to [`reset`](StorageRegistry::reset) it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::{BackendError, BackendResult, Storage, StorageChain};

/// Builds a storage from its configuration.
pub type StorageConstructor =
    dyn Fn(&StorageConfig) -> BackendResult<Arc<dyn Storage>> + Send + Sync;

/// Configuration of one storage.
///
/// ```json
/// { "kind": "moka", "name": "local", "options": { "capacity": 10000 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Registered constructor to use.
    pub kind: SmolStr,
    /// Instance identity, defaults to the kind.
    #[serde(default)]
    pub name: Option<SmolStr>,
    /// Kind-specific options.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl StorageConfig {
    pub fn new(kind: impl Into<SmolStr>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<SmolStr>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }

    /// Reads a typed option.
    pub fn option<T: DeserializeOwned>(&self, key: &str) -> BackendResult<Option<T>> {
        self.options
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|source| {
                    BackendError::internal(RegistryError::InvalidOption {
                        storage: self.instance_name().to_owned(),
                        option: key.to_owned(),
                        source,
                    })
                })
            })
            .transpose()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no storage registered for kind `{0}`")]
    UnknownKind(String),
    #[error("invalid option `{option}` for storage `{storage}`: {source}")]
    InvalidOption {
        storage: String,
        option: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Storage constructors and the instances built from them.
#[derive(Default)]
pub struct StorageRegistry {
    constructors: DashMap<SmolStr, Arc<StorageConstructor>>,
    instances: DashMap<SmolStr, Arc<dyn Storage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constructor of `kind`, replacing any previous one.
    pub fn register<F>(&self, kind: impl Into<SmolStr>, constructor: F) -> &Self
    where
        F: Fn(&StorageConfig) -> BackendResult<Arc<dyn Storage>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    /// Builds and initializes the configured storages, in order.
    ///
    /// Instances already built under the same name are reused as is.
    #[tracing::instrument(skip_all, level = "debug")]
    pub async fn init(&self, configs: &[StorageConfig]) -> BackendResult<Vec<Arc<dyn Storage>>> {
        let mut storages = Vec::with_capacity(configs.len());
        for config in configs {
            let name = SmolStr::new(config.instance_name());
            let existing = self.instances.get(&name).map(|entry| entry.value().clone());
            if let Some(storage) = existing {
                storages.push(storage);
                continue;
            }

            let constructor = self
                .constructors
                .get(&config.kind)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| {
                    BackendError::internal(RegistryError::UnknownKind(config.kind.to_string()))
                })?;
            let storage = constructor(config)?;
            storage.init().await?;
            tracing::debug!(storage = %name, kind = %config.kind, "storage initialized");
            self.instances.insert(name, storage.clone());
            storages.push(storage);
        }
        Ok(storages)
    }

    /// Builds a [`StorageChain`] over the configured storages.
    pub async fn chain(
        &self,
        configs: &[StorageConfig],
        read_timeout: Duration,
    ) -> BackendResult<StorageChain> {
        let storages = self.init(configs).await?;
        Ok(StorageChain::new(storages).with_read_timeout(read_timeout))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Storage>> {
        self.instances.get(name).map(|entry| entry.value().clone())
    }

    /// Names of the built instances, sorted.
    pub fn instances(&self) -> Vec<SmolStr> {
        let mut names: Vec<_> = self.instances.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Resets every built instance and forgets them.
    ///
    /// The next [`init`](Self::init) builds fresh instances.
    pub async fn reset(&self) -> BackendResult<()> {
        let storages: Vec<_> = self.instances.iter().map(|entry| entry.value().clone()).collect();
        self.instances.clear();
        let mut outcome = Ok(());
        for storage in storages {
            if let Err(error) = storage.reset().await {
                tracing::warn!(backend = storage.name(), error = ?error, "storage reset failed");
                if outcome.is_ok() {
                    outcome = Err(error);
                }
            }
        }
        outcome
    }
}
