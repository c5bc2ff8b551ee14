use std::sync::Arc;

use stashbox::{CacheConfig, CacheError, CachePipeline, CachePipelineBuilder, OffloadManager};
use stashbox_backend::Storage;
use tower::Layer;

use crate::service::CacheService;

/// Tower layer wrapping services with a shared [`CachePipeline`].
///
/// Every service produced by the layer shares the pipeline, so they see the
/// same storages, coalescing table and surrogate index.
#[derive(Clone, Debug)]
pub struct Cache {
    pipeline: CachePipeline,
}

impl Cache {
    pub fn new(pipeline: CachePipeline) -> Self {
        Cache { pipeline }
    }

    pub fn builder() -> CacheBuilder {
        CacheBuilder::default()
    }

    pub fn pipeline(&self) -> &CachePipeline {
        &self.pipeline
    }
}

impl<S> Layer<S> for Cache {
    type Service = CacheService<S>;

    fn layer(&self, upstream: S) -> Self::Service {
        CacheService::new(upstream, self.pipeline.clone())
    }
}

/// Fluent builder for [`Cache`].
#[derive(Default)]
pub struct CacheBuilder {
    pipeline: CachePipelineBuilder,
}

impl CacheBuilder {
    pub fn config(self, config: CacheConfig) -> Self {
        CacheBuilder {
            pipeline: self.pipeline.config(config),
        }
    }

    /// Appends a storage level. The first one added is read first.
    pub fn storage(self, storage: impl Storage + 'static) -> Self {
        CacheBuilder {
            pipeline: self.pipeline.storage(storage),
        }
    }

    pub fn shared_storage(self, storage: Arc<dyn Storage>) -> Self {
        CacheBuilder {
            pipeline: self.pipeline.shared_storage(storage),
        }
    }

    pub fn offload_manager(self, manager: OffloadManager) -> Self {
        CacheBuilder {
            pipeline: self.pipeline.offload_manager(manager),
        }
    }

    /// Fails when no storage was added or the configuration does not compile.
    pub fn build(self) -> Result<Cache, CacheError> {
        self.pipeline.build().map(Cache::new)
    }
}
