use std::fmt::Debug;

use bytes::Bytes;
use http::{Response, StatusCode};
use stashbox_core::{CachedEntry, StoredResponse, VariedHeaders};

use crate::cache_status::CacheStatus;
use crate::error::SharedError;

/// A stored entry being revalidated with the origin.
#[derive(Debug, Clone)]
pub struct Revalidation {
    pub entry: CachedEntry,
    /// The entry may be served if the origin fails.
    pub stale_fallback: bool,
}

/// Stage of one request through the pipeline.
#[allow(missing_docs)]
pub enum State {
    /// The cache is skipped, the request goes to the origin untouched.
    Bypass { reason: &'static str },
    /// Key computed, storage about to be consulted.
    Lookup,
    /// A usable entry was found, or a bare `304` answers the request.
    ServeHit {
        entry: CachedEntry,
        not_modified: bool,
    },
    /// The entry must be confirmed by the origin before it is served.
    Revalidating(Revalidation),
    /// A stale entry is served, optionally refreshed in the background.
    ServingStale {
        entry: CachedEntry,
        refresh: bool,
        detail: Option<&'static str>,
        fwd_status: Option<StatusCode>,
    },
    /// The origin is asked, through the coalescing layer.
    Upstream { revalidation: Option<Revalidation> },
    /// The origin answer was classified and written, it is rendered here.
    Store {
        fetched: Fetched,
        revalidation: Option<Revalidation>,
    },
    /// Final state with response.
    Done {
        response: Response<Bytes>,
        status: CacheStatus,
        storage: Option<String>,
    },
}

impl Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Bypass { .. } => f.write_str("State::Bypass"),
            State::Lookup => f.write_str("State::Lookup"),
            State::ServeHit { .. } => f.write_str("State::ServeHit"),
            State::Revalidating(_) => f.write_str("State::Revalidating"),
            State::ServingStale { .. } => f.write_str("State::ServingStale"),
            State::Upstream { .. } => f.write_str("State::Upstream"),
            State::Store { .. } => f.write_str("State::Store"),
            State::Done { .. } => f.write_str("State::Done"),
        }
    }
}

/// Result of one origin round-trip, shared between coalesced callers.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub result: Result<Answer, FetchFailure>,
}

impl Fetched {
    pub(crate) fn failed(failure: FetchFailure) -> Self {
        Self { result: Err(failure) }
    }

    /// Whether a caller other than the one that triggered the fetch may use it.
    ///
    /// Only stored answers matching the caller's varied headers and origin
    /// failures are shared, anything else may be specific to the leader.
    pub(crate) fn is_shareable_with(&self, request: &http::HeaderMap) -> bool {
        match &self.result {
            Err(_) => true,
            Ok(answer) if crate::cacheability::is_upstream_error(answer.origin_status) => true,
            Ok(answer) => {
                answer.stored
                    && answer
                        .varied_headers
                        .as_ref()
                        .is_none_or(|varied| stashbox_core::vary::matches(varied, request))
            }
        }
    }
}

/// A response the origin produced.
#[derive(Debug, Clone)]
pub struct Answer {
    /// What the client is served, the stored shape when it was stored.
    pub response: StoredResponse,
    pub origin_status: StatusCode,
    /// The origin confirmed the stored entry with a `304`.
    pub revalidated: bool,
    pub stored: bool,
    pub details: Vec<smol_str::SmolStr>,
    pub varied_headers: Option<VariedHeaders>,
}

/// Why an origin round-trip produced nothing usable.
#[derive(Debug, Clone)]
pub enum FetchFailure {
    Request(SharedError),
    Body(SharedError),
    Deadline(std::time::Duration),
}
