//! Cache configuration.
//!
//! [`CacheConfig`] is plain serde data, every field has a default so a
//! partial document deserializes:
//!
//! ```
//! use std::time::Duration;
//! use stashbox::config::{CacheConfig, CacheMode};
//!
//! let config: CacheConfig = serde_json::from_str(r#"{
//!     "name": "edge",
//!     "ttl": "5m",
//!     "stale": "1h",
//!     "mode": "bypass_request",
//!     "timeout": { "backend": "250ms" }
//! }"#).unwrap();
//!
//! assert_eq!(config.ttl, Duration::from_secs(300));
//! assert_eq!(config.mode, CacheMode::BypassRequest);
//! assert_eq!(config.timeout.backend, Duration::from_millis(250));
//! ```
//!
//! Regexes, methods and header values are checked once by
//! [`CacheConfig::compile`].

use std::time::Duration;

use http::header::{AUTHORIZATION, HeaderValue};
use http::{HeaderMap, Method};
use regex::Regex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use stashbox_backend::DEFAULT_READ_TIMEOUT;
use stashbox_core::{KeyConfig, KeyRules, ResponseCacheControl, Vary};

use crate::error::CacheError;

/// Default base path of the management API.
pub const DEFAULT_API_BASE_PATH: &str = "/stashbox-api/stashbox";

const DEFAULT_NAME: &str = "Stashbox";
const DEFAULT_TTL: Duration = Duration::from_secs(120);
const DEFAULT_COALESCING_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TAG_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How strictly RFC 9111 directives are honored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Honor every request and response directive.
    #[default]
    Strict,
    /// Ignore `no-store`, `no-cache` and `private` on both sides.
    Bypass,
    /// Ignore request `no-store` and `no-cache`.
    BypassRequest,
    /// Ignore response `no-store`, `no-cache` and `private`.
    BypassResponse,
}

impl CacheMode {
    pub fn ignores_request(&self) -> bool {
        matches!(self, Self::Bypass | Self::BypassRequest)
    }

    pub fn ignores_response(&self) -> bool {
        matches!(self, Self::Bypass | Self::BypassResponse)
    }
}

/// Deadlines applied by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on one storage lookup, a slower storage counts as a miss.
    #[serde(with = "humantime_serde")]
    pub backend: Duration,
    /// Bound on one origin round-trip, unbounded when absent.
    #[serde(with = "humantime_serde")]
    pub upstream: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_READ_TIMEOUT,
            upstream: None,
        }
    }
}

/// What happens to a coalesced fetch when its leader goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescingMode {
    /// The fetch runs on its own task and always completes.
    #[default]
    Detached,
    /// The fetch is cancelled with its leader, waiters retry.
    FollowCaller,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescingConfig {
    pub enabled: bool,
    pub mode: CoalescingMode,
    /// How long a waiter waits for the leader.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CoalescingMode::default(),
            timeout: DEFAULT_COALESCING_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateConfig {
    pub enabled: bool,
    /// Keep tag sets after a purge.
    pub keep_stale: bool,
    /// Lifetime of a tag set in storage.
    #[serde(with = "humantime_serde")]
    pub tag_ttl: Duration,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_stale: false,
            tag_ttl: DEFAULT_TAG_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub base_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_path: DEFAULT_API_BASE_PATH.to_owned(),
        }
    }
}

/// Decides whether a response may be shared across users.
///
/// A `private` response is never shared. A response to a request carrying
/// `Authorization` is shared only when it varies on `Authorization`, or when
/// `honor_public` is set and the response is explicitly `public`, carries
/// `s-maxage` or `must-revalidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationPolicy {
    pub honor_public: bool,
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        Self { honor_public: true }
    }
}

impl AuthorizationPolicy {
    pub fn allows(&self, request: &HeaderMap, response: &ResponseCacheControl, vary: &Vary) -> bool {
        if response.private {
            return false;
        }
        if !request.contains_key(AUTHORIZATION) || vary.contains(&AUTHORIZATION) {
            return true;
        }
        self.honor_public && (response.public || response.s_maxage.is_some() || response.must_revalidate)
    }
}

/// Key configuration applied to URIs matching `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOverride {
    pub pattern: String,
    #[serde(default)]
    pub key: KeyConfig,
}

/// Configuration of one cache instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name rendered in `Cache-Status`.
    pub name: SmolStr,
    /// Upper bound on any freshness lifetime, and the lifetime of responses
    /// declaring none.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long entries outlive their freshness.
    #[serde(with = "humantime_serde")]
    pub stale: Duration,
    /// `Cache-Control` assumed for responses without one.
    pub default_cache_control: Option<String>,
    pub allowed_methods: Vec<String>,
    /// Requests whose URI matches bypass the cache.
    pub exclude: Option<String>,
    pub key: KeyConfig,
    pub key_overrides: Vec<KeyOverride>,
    pub mode: CacheMode,
    pub timeout: TimeoutConfig,
    pub coalescing: CoalescingConfig,
    pub surrogate: SurrogateConfig,
    pub api: ApiConfig,
    pub authorization: AuthorizationPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: SmolStr::new_static(DEFAULT_NAME),
            ttl: DEFAULT_TTL,
            stale: Duration::ZERO,
            default_cache_control: None,
            allowed_methods: vec![Method::GET.to_string(), Method::HEAD.to_string()],
            exclude: None,
            key: KeyConfig::default(),
            key_overrides: Vec::new(),
            mode: CacheMode::default(),
            timeout: TimeoutConfig::default(),
            coalescing: CoalescingConfig::default(),
            surrogate: SurrogateConfig::default(),
            api: ApiConfig::default(),
            authorization: AuthorizationPolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validates the configuration and compiles its patterns.
    pub fn compile(self) -> Result<CompiledConfig, CacheError> {
        let exclude = self
            .exclude
            .as_deref()
            .map(|pattern| compile_regex("exclude", pattern))
            .transpose()?;

        let overrides = self
            .key_overrides
            .iter()
            .map(|o| Ok((compile_regex("key override", &o.pattern)?, o.key.clone())))
            .collect::<Result<Vec<_>, CacheError>>()?;

        let allowed_methods = self
            .allowed_methods
            .iter()
            .map(|method| {
                Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| CacheError::Config(format!("unknown method `{method}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let default_cache_control = self
            .default_cache_control
            .as_deref()
            .map(|value| {
                HeaderValue::from_str(value).map_err(|_| {
                    CacheError::Config(format!("invalid default cache-control `{value}`"))
                })
            })
            .transpose()?;

        if !self.api.base_path.starts_with('/') {
            return Err(CacheError::Config(format!(
                "api base path `{}` must start with `/`",
                self.api.base_path
            )));
        }
        if self.coalescing.timeout.is_zero() {
            return Err(CacheError::Config("coalescing timeout must not be zero".to_owned()));
        }

        Ok(CompiledConfig {
            keys: KeyRules::new(self.key.clone(), overrides),
            exclude,
            allowed_methods,
            default_cache_control,
            config: self,
        })
    }
}

fn compile_regex(what: &str, pattern: &str) -> Result<Regex, CacheError> {
    Regex::new(pattern).map_err(|error| CacheError::Config(format!("{what} pattern `{pattern}`: {error}")))
}

/// A validated [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub config: CacheConfig,
    pub keys: KeyRules,
    pub exclude: Option<Regex>,
    pub allowed_methods: Vec<Method>,
    pub default_cache_control: Option<HeaderValue>,
}

impl CompiledConfig {
    pub fn is_excluded(&self, request_uri: &str) -> bool {
        self.exclude.as_ref().is_some_and(|re| re.is_match(request_uri))
    }

    pub fn is_allowed(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }
}

/// Fluent construction of a [`CacheConfig`].
#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn name(mut self, name: impl Into<SmolStr>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    pub fn stale(mut self, stale: Duration) -> Self {
        self.config.stale = stale;
        self
    }

    pub fn default_cache_control(mut self, value: impl Into<String>) -> Self {
        self.config.default_cache_control = Some(value.into());
        self
    }

    pub fn allowed_methods<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: ToString,
    {
        self.config.allowed_methods = methods.into_iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.config.exclude = Some(pattern.into());
        self
    }

    pub fn key(mut self, key: KeyConfig) -> Self {
        self.config.key = key;
        self
    }

    pub fn key_override(mut self, pattern: impl Into<String>, key: KeyConfig) -> Self {
        self.config.key_overrides.push(KeyOverride {
            pattern: pattern.into(),
            key,
        });
        self
    }

    pub fn mode(mut self, mode: CacheMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout.backend = timeout;
        self
    }

    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout.upstream = Some(timeout);
        self
    }

    pub fn coalescing(mut self, coalescing: CoalescingConfig) -> Self {
        self.config.coalescing = coalescing;
        self
    }

    pub fn surrogate(mut self, surrogate: SurrogateConfig) -> Self {
        self.config.surrogate = surrogate;
        self
    }

    pub fn api(mut self, api: ApiConfig) -> Self {
        self.config.api = api;
        self
    }

    pub fn authorization(mut self, policy: AuthorizationPolicy) -> Self {
        self.config.authorization = policy;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderName;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.timeout.backend, Duration::from_secs(10));
        assert_eq!(config.coalescing.timeout, Duration::from_secs(60));
        assert_eq!(config.api.base_path, DEFAULT_API_BASE_PATH);
    }

    #[test]
    fn invalid_patterns_fail_compilation() {
        let error = CacheConfig::builder().exclude("(unclosed").build().compile().unwrap_err();
        assert!(matches!(error, CacheError::Config(_)), "got {error:?}");

        let error = CacheConfig::builder()
            .key_override("[", KeyConfig::default())
            .build()
            .compile()
            .unwrap_err();
        assert!(matches!(error, CacheError::Config(_)), "got {error:?}");
    }

    #[test]
    fn methods_are_normalized() {
        let compiled = CacheConfig::builder()
            .allowed_methods(["get", "post"])
            .build()
            .compile()
            .unwrap();
        assert!(compiled.is_allowed(&Method::POST));
        assert!(!compiled.is_allowed(&Method::HEAD));
    }

    #[test]
    fn authorization_needs_an_explicit_signal() {
        let policy = AuthorizationPolicy::default();
        let mut request = HeaderMap::new();
        request.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        let plain = ResponseCacheControl::default();
        let public = ResponseCacheControl {
            public: true,
            ..Default::default()
        };
        let no_vary = Vary::default();

        assert!(policy.allows(&HeaderMap::new(), &plain, &no_vary));
        assert!(!policy.allows(&request, &plain, &no_vary));
        assert!(policy.allows(&request, &public, &no_vary));
        assert!(!AuthorizationPolicy { honor_public: false }.allows(&request, &public, &no_vary));

        let mut response = HeaderMap::new();
        response.insert(HeaderName::from_static("vary"), HeaderValue::from_static("Authorization"));
        assert!(policy.allows(&request, &plain, &Vary::from_headers(&response)));
    }

    #[test]
    fn private_is_never_shared() {
        let private = ResponseCacheControl {
            private: true,
            public: true,
            ..Default::default()
        };
        assert!(!AuthorizationPolicy::default().allows(&HeaderMap::new(), &private, &Vary::default()));
    }
}
