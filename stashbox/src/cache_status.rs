//! The `Cache-Status` response header (RFC 9211).
//!
//! ```
//! use http::StatusCode;
//! use stashbox::cache_status::{CacheStatus, Outcome, detail};
//!
//! let status = CacheStatus::new("Stashbox", Outcome::UriMiss)
//!     .fwd_status(StatusCode::OK)
//!     .key("GET-example.com-/")
//!     .detail(detail::insertion_error("redis"))
//!     .stored(true);
//!
//! assert_eq!(
//!     status.render(),
//!     "Stashbox; fwd=uri-miss; fwd-status=200; key=GET-example.com-/; detail=REDIS-INSERTION-ERROR; stored",
//! );
//! ```

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use smol_str::SmolStr;

pub const CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");

/// Reason codes rendered as `detail=...`.
pub mod detail {
    pub const EXCLUDED_REQUEST_URI: &str = "EXCLUDED-REQUEST-URI";
    pub const UNSUPPORTED_METHOD: &str = "UNSUPPORTED-METHOD";
    pub const CACHE_CONTROL_EXTRACTION_ERROR: &str = "CACHE-CONTROL-EXTRACTION-ERROR";
    pub const IS_MUTATION_REQUEST: &str = "IS-MUTATION-REQUEST";
    pub const NO_STORE_DIRECTIVE: &str = "NO-STORE-DIRECTIVE";
    pub const ONLY_IF_CACHED_MISS: &str = "ONLY-IF-CACHED-MISS";
    pub const PRIVATE_OR_AUTHENTICATED_RESPONSE: &str = "PRIVATE-OR-AUTHENTICATED-RESPONSE";
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE-EXCEEDED";
    pub const REQUEST_REVALIDATION: &str = "REQUEST-REVALIDATION";
    pub const UNCACHEABLE_STATUS_CODE: &str = "UNCACHEABLE-STATUS-CODE";
    pub const UPSTREAM_VARY_STAR: &str = "UPSTREAM-VARY-STAR";
    pub const INVALID_RESPONSE_CACHE_CONTROL: &str = "INVALID-RESPONSE-CACHE-CONTROL";
    pub const BROKEN_PIPE: &str = "REQUEST-CANCELED-OR-UPSTREAM-BROKEN-PIPE";
    pub const COALESCING_TIMEOUT: &str = "COALESCING-TIMEOUT";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM-ERROR";

    /// Detail reported when writing to `storage` failed.
    pub fn insertion_error(storage: &str) -> String {
        format!("{}-INSERTION-ERROR", storage.to_ascii_uppercase())
    }
}

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served from storage.
    Hit,
    /// Forwarded, nothing usable was stored.
    UriMiss,
    /// Forwarded because the request or the stored entry demanded it.
    Request,
    /// Forwarded without consulting the cache.
    Bypass,
    /// Served from storage past its freshness.
    Stale,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::UriMiss => "uri-miss",
            Self::Request => "request",
            Self::Bypass => "bypass",
            Self::Stale => "stale",
        }
    }
}

/// Builder of one `Cache-Status` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    name: SmolStr,
    outcome: Outcome,
    fwd_status: Option<u16>,
    ttl: Option<i64>,
    key: Option<String>,
    details: Vec<SmolStr>,
    stored: bool,
}

impl CacheStatus {
    pub fn new(name: impl Into<SmolStr>, outcome: Outcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            fwd_status: None,
            ttl: None,
            key: None,
            details: Vec::new(),
            stored: false,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn details(&self) -> &[SmolStr] {
        &self.details
    }

    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Status the origin answered with.
    pub fn fwd_status(mut self, status: StatusCode) -> Self {
        self.fwd_status = Some(status.as_u16());
        self
    }

    /// Remaining freshness in seconds, negative once stale.
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Appends a reason code, duplicates are ignored.
    pub fn detail(mut self, detail: impl Into<SmolStr>) -> Self {
        let detail = detail.into();
        if !self.details.contains(&detail) {
            self.details.push(detail);
        }
        self
    }

    pub fn stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }

    pub fn render(&self) -> String {
        self.render_with(self.key.as_deref())
    }

    fn render_with(&self, key: Option<&str>) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(&self.name);
        match self.outcome {
            Outcome::Hit | Outcome::Stale => out.push_str("; hit"),
            other => {
                out.push_str("; fwd=");
                out.push_str(other.as_str());
            }
        }
        if let Some(status) = self.fwd_status {
            out.push_str(&format!("; fwd-status={status}"));
        }
        if let Some(ttl) = self.ttl {
            out.push_str(&format!("; ttl={ttl}"));
        }
        if let Some(key) = key {
            out.push_str("; key=");
            out.push_str(key);
        }
        for detail in &self.details {
            out.push_str("; detail=");
            out.push_str(detail);
        }
        if self.stored {
            out.push_str("; stored");
        }
        if self.outcome == Outcome::Stale {
            out.push_str("; fwd=stale");
        }
        out
    }

    /// Renders as a header value.
    ///
    /// A key that is not a valid header value is left out.
    pub fn to_header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.render())
            .or_else(|_| HeaderValue::from_str(&self.render_with(None)))
            .unwrap_or_else(|_| HeaderValue::from_static("invalid"))
    }

    /// Sets `Cache-Status` on `headers`, replacing any previous value.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(CACHE_STATUS, self.to_header_value());
    }
}
