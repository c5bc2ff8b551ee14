#![doc = include_str!("../README.md")]

mod chain;
pub mod codec;
pub mod compressor;
mod error;
mod locks;
pub mod metrics;
pub mod multi_level;
pub mod registry;
mod storage;

pub use chain::{DEFAULT_READ_TIMEOUT, StoreReport, StorageChain};
#[cfg(feature = "gzip")]
pub use compressor::GzipCompressor;
#[cfg(feature = "zstd")]
pub use compressor::ZstdCompressor;
pub use compressor::{CompressionError, Compressor, PassthroughCompressor};
pub use error::{BackendError, DeleteStatus, FormatError};
pub use locks::{KeyLockGuard, KeyLocks};
pub use multi_level::{MultiLevelStorage, VariantWrite};
pub use registry::{RegistryError, StorageConfig, StorageConstructor, StorageRegistry};
pub use storage::{BackendResult, Storage};
