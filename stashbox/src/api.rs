//! Management endpoint: key listing, purge and invalidation.
//!
//! All routes live under the configured base path:
//!
//! | Method  | Path                      | Effect                                        |
//! |---------|---------------------------|-----------------------------------------------|
//! | `GET`   | `<base>`                  | JSON array of stored keys                     |
//! | `GET`   | `<base>/surrogate_keys`   | JSON object of tag to keys                    |
//! | `GET`   | `<base>/<regex>`          | keys matching the regex, `404` when none      |
//! | `PURGE` | `<base>`                  | purges the tags named in the request headers  |
//! | `PURGE` | `<base>/flush`            | empties every storage                         |
//! | `PURGE` | `<base>/mapping`          | drops expired variants from every mapping     |
//! | `PURGE` | `<base>/<regex>`          | deletes every key matching the regex          |
//! | `POST`  | `<base>`                  | JSON invalidation, see [`Invalidation`]       |

use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::Utc;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use stashbox_core::{CacheKey, MAPPING_KEY_PREFIX, SURROGATE_KEY_PREFIX, VariedKey};
use tracing::{debug, info, warn};

use crate::fsm::CachePipeline;

const SURROGATE_KEYS_PATH: &str = "surrogate_keys";
const FLUSH_PATH: &str = "flush";
const MAPPING_PATH: &str = "mapping";

/// What a `POST` invalidation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationKind {
    /// Exact `host/path` selectors.
    Uri,
    /// `host/path` selectors matching everything below them.
    UriPrefix,
    /// Every key of the selected hosts.
    Origin,
    /// Surrogate-key groups.
    Group,
}

/// Body of a `POST` invalidation.
///
/// ```json
/// {"type": "uri-prefix", "selectors": ["example.com/articles"], "purge": true}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    #[serde(rename = "type")]
    pub kind: InvalidationKind,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Delete the entries instead of marking them stale.
    #[serde(default)]
    pub purge: bool,
}

/// A `host[:port]/path` selector split into the pieces keys are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selector {
    host: String,
    /// `host-path`, the way both appear inside a base key.
    host_path: String,
}

impl Selector {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let url = url::Url::parse(&format!("http://{raw}")).ok()?;
        let mut host = url.host_str()?.to_owned();
        if let Some(port) = url.port() {
            host = format!("{host}:{port}");
        }
        Some(Self {
            host_path: format!("{host}-{}", url.path()),
            host,
        })
    }

    fn matches(&self, kind: InvalidationKind, base: &str) -> bool {
        match kind {
            InvalidationKind::Uri => base.ends_with(&self.host_path),
            InvalidationKind::UriPrefix => {
                base.ends_with(&self.host_path)
                    || ['-', '?', '/']
                        .iter()
                        .any(|next| base.contains(&format!("{}{next}", self.host_path)))
            }
            InvalidationKind::Origin => base.contains(&self.host),
            InvalidationKind::Group => false,
        }
    }
}

fn is_internal(key: &str) -> bool {
    key.starts_with(MAPPING_KEY_PREFIX) || key.starts_with(SURROGATE_KEY_PREFIX)
}

/// Handles requests addressed to the management base path.
#[derive(Debug, Clone)]
pub struct ManagementApi {
    pipeline: CachePipeline,
    base_path: String,
}

impl ManagementApi {
    pub fn new(pipeline: CachePipeline) -> Self {
        let base_path = pipeline
            .config()
            .config
            .api
            .base_path
            .trim_end_matches('/')
            .to_owned();
        Self {
            pipeline,
            base_path,
        }
    }

    /// Whether `path` is served by the management API.
    pub fn matches(&self, path: &str) -> bool {
        self.pipeline.config().config.api.enabled
            && (path == self.base_path
                || path
                    .strip_prefix(self.base_path.as_str())
                    .is_some_and(|rest| rest.starts_with('/')))
    }

    fn subpath<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.base_path.as_str())
            .unwrap_or(path)
            .trim_start_matches('/')
    }

    #[tracing::instrument(name = "management", skip_all, fields(method = %request.method(), path = request.uri().path()))]
    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        let subpath = self.subpath(request.uri().path()).to_owned();
        let method = request.method().clone();

        if method == Method::GET {
            self.get(&subpath).await
        } else if method == Method::POST && subpath.is_empty() {
            self.post(request.body()).await
        } else if method.as_str() == "PURGE" {
            self.purge(&subpath, request.headers()).await
        } else {
            status(StatusCode::METHOD_NOT_ALLOWED)
        }
    }

    async fn stored_keys(&self) -> Vec<String> {
        self.pipeline
            .storages()
            .list_keys()
            .await
            .into_iter()
            .filter(|key| !is_internal(key))
            .collect()
    }

    /// Base keys of every stored representation, de-duplicated.
    async fn base_keys(&self) -> BTreeSet<CacheKey> {
        self.stored_keys()
            .await
            .iter()
            .map(|key| VariedKey::decode(key).0)
            .collect()
    }

    async fn get(&self, subpath: &str) -> Response<Bytes> {
        match subpath {
            "" => json(StatusCode::OK, &self.stored_keys().await),
            SURROGATE_KEYS_PATH => json(StatusCode::OK, &self.pipeline.surrogates().list_tags().await),
            pattern => {
                let Ok(pattern) = Regex::new(pattern) else {
                    return status(StatusCode::BAD_REQUEST);
                };
                let keys: Vec<String> = self
                    .stored_keys()
                    .await
                    .into_iter()
                    .filter(|key| pattern.is_match(key))
                    .collect();
                if keys.is_empty() {
                    status(StatusCode::NOT_FOUND)
                } else {
                    json(StatusCode::OK, &keys)
                }
            }
        }
    }

    async fn post(&self, body: &Bytes) -> Response<Bytes> {
        let invalidation: Invalidation = match serde_json::from_slice(body) {
            Ok(invalidation) => invalidation,
            Err(error) => {
                debug!(error = %error, "invalidation body rejected");
                return status(StatusCode::BAD_REQUEST);
            }
        };
        let affected = self.invalidate(&invalidation).await;
        info!(kind = ?invalidation.kind, purge = invalidation.purge, affected, "invalidation applied");
        status(StatusCode::NO_CONTENT)
    }

    /// Applies an invalidation and returns the number of base keys it hit.
    pub async fn invalidate(&self, invalidation: &Invalidation) -> usize {
        let targets: Vec<CacheKey> = match invalidation.kind {
            InvalidationKind::Group => {
                let (keys, _) = self
                    .pipeline
                    .surrogates()
                    .purge_tags(&invalidation.groups)
                    .await;
                keys.into_iter().map(CacheKey::from).collect()
            }
            kind => {
                let selectors: Vec<Selector> = invalidation
                    .selectors
                    .iter()
                    .filter_map(|raw| {
                        let parsed = Selector::parse(raw);
                        if parsed.is_none() {
                            debug!(selector = raw, "invalid selector ignored");
                        }
                        parsed
                    })
                    .collect();
                self.base_keys()
                    .await
                    .into_iter()
                    .filter(|base| {
                        selectors
                            .iter()
                            .any(|selector| selector.matches(kind, base.as_str()))
                    })
                    .collect()
            }
        };

        let now = Utc::now();
        for base in &targets {
            self.pipeline
                .storages()
                .invalidate(base, invalidation.purge, now)
                .await;
        }
        targets.len()
    }

    async fn purge(&self, subpath: &str, headers: &http::HeaderMap) -> Response<Bytes> {
        let storages = self.pipeline.storages();
        match subpath {
            FLUSH_PATH => {
                if let Err(error) = storages.reset().await {
                    warn!(error = %error, "flush failed");
                    return status(StatusCode::INTERNAL_SERVER_ERROR);
                }
                info!("cache flushed");
            }
            MAPPING_PATH => {
                let dropped = storages.purge_expired_mappings(Utc::now()).await;
                info!(dropped, "expired variants dropped from mappings");
            }
            "" => {
                let (keys, tags) = self.pipeline.surrogates().purge(headers).await;
                let now = Utc::now();
                for key in &keys {
                    storages.invalidate(&CacheKey::from(key.as_str()), true, now).await;
                }
                info!(tags = ?tags, keys = keys.len(), "surrogate keys purged");
            }
            pattern => {
                let Ok(pattern) = Regex::new(pattern) else {
                    return status(StatusCode::BAD_REQUEST);
                };
                let now = Utc::now();
                let mut purged = 0;
                for key in self.stored_keys().await {
                    if !pattern.is_match(&key) {
                        continue;
                    }
                    let (base, _) = VariedKey::decode(&key);
                    storages.invalidate(&base, true, now).await;
                    storages.delete(&key).await;
                    purged += 1;
                }
                info!(pattern = %pattern, purged, "keys purged");
            }
        }
        status(StatusCode::NO_CONTENT)
    }
}

fn status(code: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = code;
    if code != StatusCode::NO_CONTENT {
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    }
    response
}

fn json<T: Serialize>(code: StatusCode, value: &T) -> Response<Bytes> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Bytes::from(body));
            *response.status_mut() = code;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(error) => {
            warn!(error = %error, "management response could not be encoded");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
