//! Cache key types and construction.
//!
//! A [`CacheKey`] identifies one logical resource. It is built from the request
//! with [`KeyRules::compute`] and never depends on response data, which is why
//! Vary-induced variation lives in [`crate::vary`] instead.
//!
//! ## Format
//!
//! ```text
//! {METHOD}-{host}-{request_uri}{-header values}{-sha256(body)}
//! ```
//!
//! Each component can be switched off with [`KeyConfig`]. Host and path are
//! always present under the default configuration, so two different resources
//! never share a key.
//!
//! ```
//! use stashbox_core::{CacheKey, KeyRules};
//!
//! let request = http::Request::get("https://example.com/articles?page=2")
//!     .body(())
//!     .unwrap();
//! let (parts, _) = request.into_parts();
//!
//! let key = KeyRules::default().compute(&parts, None);
//! assert_eq!(key.as_str(), "GET-example.com-/articles?page=2");
//! assert_eq!(key.mapping_key(), "IDX_GET-example.com-/articles?page=2");
//! ```

use std::fmt;

use http::header::HOST;
use http::request::Parts;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

/// Prefix of the namespace holding [`Mapping`](crate::Mapping) records.
pub const MAPPING_KEY_PREFIX: &str = "IDX_";

/// Prefix of the namespace holding surrogate-key tag sets.
pub const SURROGATE_KEY_PREFIX: &str = "SURROGATE_";

/// Base cache key of a resource, ignoring Vary-induced variation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(SmolStr);

impl CacheKey {
    /// Wraps an already computed key.
    pub fn new(key: impl Into<SmolStr>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Storage key of the mapping record owned by this base key.
    pub fn mapping_key(&self) -> String {
        format!("{MAPPING_KEY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Switches controlling which request components make up a [`CacheKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Drop the request body digest.
    pub disable_body: bool,
    /// Drop the host.
    pub disable_host: bool,
    /// Drop the method.
    pub disable_method: bool,
    /// Drop the query string.
    pub disable_query: bool,
    /// Do not expose the key in the `Cache-Status` header.
    pub hide: bool,
    /// Request headers whose values are appended to the key, in order.
    pub headers: Vec<String>,
}

/// Default key configuration plus per-URI overrides.
///
/// The first override whose regex matches the request URI replaces the
/// default configuration entirely.
#[derive(Debug, Clone, Default)]
pub struct KeyRules {
    default: KeyConfig,
    overrides: Vec<(Regex, KeyConfig)>,
}

impl KeyRules {
    /// Creates rules from a default configuration and ordered overrides.
    pub fn new(default: KeyConfig, overrides: Vec<(Regex, KeyConfig)>) -> Self {
        Self { default, overrides }
    }

    /// Returns the configuration that applies to `request_uri`.
    pub fn config_for(&self, request_uri: &str) -> &KeyConfig {
        self.overrides
            .iter()
            .find(|(pattern, _)| pattern.is_match(request_uri))
            .map(|(_, config)| config)
            .unwrap_or(&self.default)
    }

    /// Computes the base key of a request.
    ///
    /// `body_digest` is the value produced by [`body_digest`] for requests whose
    /// body participates in the key.
    pub fn compute(&self, parts: &Parts, body_digest: Option<&str>) -> CacheKey {
        let uri = request_uri(parts, false);
        let config = self.config_for(&uri);

        let mut key = String::with_capacity(uri.len() + 32);
        if !config.disable_method {
            key.push_str(parts.method.as_str());
            key.push('-');
        }
        if !config.disable_host {
            key.push_str(&request_host(parts));
            key.push('-');
        }
        if config.disable_query {
            key.push_str(&request_uri(parts, true));
        } else {
            key.push_str(&uri);
        }
        for name in &config.headers {
            let value = parts
                .headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            key.push('-');
            key.push_str(value);
        }
        if !config.disable_body {
            if let Some(digest) = body_digest {
                key.push('-');
                key.push_str(digest);
            }
        }
        CacheKey::new(key)
    }

    /// Whether the key should be rendered in diagnostics for this URI.
    pub fn is_hidden(&self, request_uri: &str) -> bool {
        self.config_for(request_uri).hide
    }
}

/// Hex-encoded SHA-256 of a non-empty request body.
pub fn body_digest(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    Some(hex::encode(Sha256::digest(body)))
}

/// Detects a GraphQL mutation sent as a JSON request body.
pub fn is_graphql_mutation(body: &[u8]) -> bool {
    const MUTATION_PREFIX: &[u8] = br#"{"query":"mutation"#;
    body.len() > MUTATION_PREFIX.len() && body.starts_with(MUTATION_PREFIX)
}

/// Host of the request, preferring the `Host` header over the URI authority.
pub fn request_host(parts: &Parts) -> String {
    parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_owned()))
        .unwrap_or_default()
}

/// Path and query of the request, defaulting to `/`.
pub fn request_uri(parts: &Parts, path_only: bool) -> String {
    if path_only {
        let path = parts.uri.path();
        return if path.is_empty() { "/".to_owned() } else { path.to_owned() };
    }
    parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned())
}
