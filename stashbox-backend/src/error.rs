//! Error types for storage operations.

use std::time::Duration;

use crate::compressor::CompressionError;
use thiserror::Error;

/// Serialization failure of a stored value.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error(transparent)]
    Serialize(Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Deserialize(Box<dyn std::error::Error + Send + Sync>),
}

/// Error type for storage operations.
///
/// Errors are grouped by origin so callers can decide what to report.
/// None of them is fatal for the request being served.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Internal storage error, state or computation error.
    ///
    /// Any error not related to network interaction.
    #[error(transparent)]
    InternalError(Box<dyn std::error::Error + Send + Sync>),

    /// Network interaction error.
    #[error(transparent)]
    ConnectionError(Box<dyn std::error::Error + Send + Sync>),

    /// Serialization or deserialization error.
    #[error(transparent)]
    FormatError(#[from] FormatError),

    /// Compression or decompression error.
    #[error(transparent)]
    CompressionError(#[from] CompressionError),

    /// The storage did not answer in time.
    #[error("storage `{storage}` timed out after {timeout:?}")]
    Timeout { storage: String, timeout: Duration },
}

impl BackendError {
    /// Wraps any error as an [`InternalError`](Self::InternalError).
    pub fn internal(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        BackendError::InternalError(Box::new(error))
    }
}

/// Status of deleting result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// Records successfully deleted.
    Deleted(u32),
    /// Record already missing.
    Missing,
}

impl DeleteStatus {
    /// Number of removed records.
    pub fn count(&self) -> u32 {
        match self {
            DeleteStatus::Deleted(count) => *count,
            DeleteStatus::Missing => 0,
        }
    }

    /// Sums two outcomes, as when one key was deleted from several storages.
    pub fn merge(self, other: DeleteStatus) -> DeleteStatus {
        match self.count() + other.count() {
            0 => DeleteStatus::Missing,
            count => DeleteStatus::Deleted(count),
        }
    }
}
