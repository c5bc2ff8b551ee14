use std::sync::Arc;
use std::time::Duration;

use stashbox_backend::BackendError;
use thiserror::Error;

/// Boxed error of an origin call.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the cache pipeline.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A storage operation failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The origin could not be reached and nothing stored could stand in.
    #[error("upstream error: {0}")]
    Upstream(BoxError),

    /// Waiting on a coalesced origin fetch failed.
    #[error(transparent)]
    Coalescing(#[from] CoalescingError),

    /// The upstream deadline elapsed.
    #[error("upstream deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Unwraps the origin error, boxing any other variant.
    pub fn into_upstream(self) -> BoxError {
        match self {
            Self::Upstream(error) => error,
            other => Box::new(other),
        }
    }
}

/// Failure of an origin round-trip as reported by an [`Upstream`](stashbox_core::Upstream).
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request never produced a response.
    #[error("upstream request failed")]
    Request(#[source] BoxError),

    /// Headers arrived but the body could not be read to the end.
    #[error("upstream body was cut short")]
    Body(#[source] BoxError),
}

impl UpstreamError {
    /// Wraps any error as a request failure.
    pub fn request(error: impl Into<BoxError>) -> Self {
        Self::Request(error.into())
    }

    /// Wraps any error as a body failure.
    pub fn body(error: impl Into<BoxError>) -> Self {
        Self::Body(error.into())
    }
}

/// Errors observed by a caller waiting on a coalesced fetch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoalescingError {
    /// The leader did not deliver a result within the wait timeout.
    #[error("coalesced fetch did not complete within {0:?}")]
    Timeout(Duration),

    /// The leader went away before delivering a result.
    #[error("coalesced fetch was abandoned by its leader")]
    Abandoned,
}

/// Origin error shared between the callers of one coalesced fetch.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<BoxError>);

impl SharedError {
    pub fn new(error: BoxError) -> Self {
        Self(Arc::new(error))
    }
}

impl std::fmt::Display for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.0)
    }
}
