//! Surrogate-key tag index.
//!
//! Responses name the groups they belong to in a tag header
//! (`Surrogate-Key: article-42 author-7`). The index maps every tag to the
//! set of base keys stored with it, under `SURROGATE_<tag>` in the storage
//! chain, so a whole group can be purged at once.
//!
//! A member set is a comma-joined list of percent-encoded keys.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use http::header::{CACHE_CONTROL, HeaderName};
use http::{HeaderMap, Method};
use regex::Regex;
use smol_str::SmolStr;
use stashbox_backend::StorageChain;
use stashbox_core::{CacheKey, SURROGATE_KEY_PREFIX};
use tracing::{debug, trace, warn};
use url::form_urlencoded;

use crate::config::SurrogateConfig;

pub const SURROGATE_KEY: HeaderName = HeaderName::from_static("surrogate-key");
pub const EDGE_CACHE_TAG: HeaderName = HeaderName::from_static("edge-cache-tag");
pub const CACHE_TAGS: HeaderName = HeaderName::from_static("cache-tags");

pub const STASHBOX_CACHE_CONTROL: HeaderName = HeaderName::from_static("stashbox-cache-control");
pub const SURROGATE_CONTROL: HeaderName = HeaderName::from_static("surrogate-control");
pub const CDN_CACHE_CONTROL: HeaderName = HeaderName::from_static("cdn-cache-control");

/// Response header naming groups to invalidate after an unsafe request.
pub const CACHE_GROUP_INVALIDATION: HeaderName = HeaderName::from_static("cache-group-invalidation");

const MEMBER_SEPARATOR: char = ',';

fn key_headers() -> [HeaderName; 3] {
    [SURROGATE_KEY, EDGE_CACHE_TAG, CACHE_TAGS]
}

fn control_headers() -> [HeaderName; 4] {
    [STASHBOX_CACHE_CONTROL, SURROGATE_CONTROL, CDN_CACHE_CONTROL, CACHE_CONTROL]
}

/// Value of the first header of `candidates` present in `headers`.
fn first_present(headers: &HeaderMap, candidates: &[HeaderName]) -> Option<String> {
    candidates.iter().find_map(|name| {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    })
}

/// Tags listed in the first present tag header, de-duplicated.
///
/// Tags are separated by commas or whitespace.
pub fn parse_tags(headers: &HeaderMap) -> Vec<String> {
    let Some(value) = first_present(headers, &key_headers()) else {
        return Vec::new();
    };
    split_tags(&value)
}

fn split_tags(value: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|tag| !tag.is_empty())
        .map(decode_member)
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

fn encode_member(key: &str) -> String {
    form_urlencoded::byte_serialize(key.as_bytes()).collect()
}

fn decode_member(member: &str) -> String {
    form_urlencoded::parse(member.as_bytes())
        .map(|(decoded, _)| decoded.into_owned())
        .next()
        .unwrap_or_default()
}

fn members(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split(MEMBER_SEPARATOR)
        .filter(|member| !member.is_empty())
        .map(decode_member)
        .collect()
}

/// Secondary index from tags to cache keys.
#[derive(Debug, Clone)]
pub struct SurrogateIndex {
    storages: StorageChain,
    name: SmolStr,
    config: SurrogateConfig,
}

impl SurrogateIndex {
    /// `name` is the cache name targeted directives like `no-store;<name>` match.
    pub fn new(storages: StorageChain, name: impl Into<SmolStr>, config: SurrogateConfig) -> Self {
        Self {
            storages,
            name: name.into(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// A surrogate control directive forbids indexing the response.
    ///
    /// `no-store` applies to every cache, `no-store;<name>` only to the cache
    /// called `<name>`.
    pub fn is_vetoed(&self, headers: &HeaderMap) -> bool {
        let Some(controls) = first_present(headers, &control_headers()) else {
            return false;
        };
        controls.split(',').map(str::trim).any(|directive| {
            let mut parts = directive.splitn(2, ';').map(str::trim);
            let is_no_store = parts
                .next()
                .is_some_and(|name| name.eq_ignore_ascii_case("no-store"));
            match parts.next() {
                _ if !is_no_store => false,
                None => true,
                Some(target) => target.eq_ignore_ascii_case(&self.name),
            }
        })
    }

    /// Indexes `key` under every tag of the response and under `base_uri`.
    ///
    /// Returns the number of tag sets the key was added to.
    #[tracing::instrument(skip(self, headers), fields(key = %key))]
    pub async fn store(&self, headers: &HeaderMap, key: &CacheKey, base_uri: &str) -> usize {
        if !self.config.enabled {
            return 0;
        }
        let mut tags = if self.is_vetoed(headers) {
            trace!("surrogate control vetoes tagging");
            Vec::new()
        } else {
            parse_tags(headers)
        };
        if !base_uri.is_empty() && !tags.iter().any(|tag| tag == base_uri) {
            tags.push(base_uri.to_owned());
        }

        let member = encode_member(key.as_str());
        let mut added = 0;
        for tag in &tags {
            if self.store_tag(tag, &member).await {
                added += 1;
            }
        }
        added
    }

    async fn store_tag(&self, tag: &str, member: &str) -> bool {
        let storage_key = format!("{SURROGATE_KEY_PREFIX}{tag}");
        let _guard = self.storages.lock(&storage_key).await;

        let current = self.storages.get(&storage_key).await.unwrap_or_default();
        let current = String::from_utf8_lossy(&current);
        if current.split(MEMBER_SEPARATOR).any(|existing| existing == member) {
            return false;
        }

        let updated = if current.is_empty() {
            member.to_owned()
        } else {
            format!("{current}{MEMBER_SEPARATOR}{member}")
        };
        let report = self
            .storages
            .set(&storage_key, updated.into_bytes().into(), self.config.tag_ttl)
            .await;
        if !report.is_stored() {
            warn!(tag, failed = ?report.failed, "surrogate tag could not be written");
        }
        report.is_stored()
    }

    async fn purge_tag(&self, tag: &str) -> Vec<String> {
        let storage_key = format!("{SURROGATE_KEY_PREFIX}{tag}");
        let _guard = self.storages.lock(&storage_key).await;
        let keys = self
            .storages
            .get(&storage_key)
            .await
            .map(|raw| members(&raw))
            .unwrap_or_default();
        if !self.config.keep_stale {
            self.storages.delete(&storage_key).await;
        }
        debug!(tag, keys = keys.len(), "purged surrogate tag");
        keys
    }

    /// Clears the tags named in the request tag header.
    ///
    /// Returns the union of the keys found, for the caller to delete, and the
    /// tags themselves.
    pub async fn purge(&self, headers: &HeaderMap) -> (Vec<String>, Vec<String>) {
        let tags = parse_tags(headers);
        self.purge_tags(&tags).await
    }

    /// Same as [`purge`](Self::purge) with the tags given directly.
    pub async fn purge_tags(&self, tags: &[String]) -> (Vec<String>, Vec<String>) {
        let mut keys = BTreeSet::new();
        for tag in tags {
            keys.extend(self.purge_tag(tag).await);
        }
        (keys.into_iter().collect(), tags.to_vec())
    }

    /// Invalidates the groups named by `Cache-Group-Invalidation` after an
    /// unsafe request.
    ///
    /// The cached entries of those groups are purged too. Returns the number
    /// of groups processed.
    pub async fn invalidate(&self, method: &Method, headers: &HeaderMap) -> usize {
        if method.is_safe() || !self.config.enabled {
            return 0;
        }
        let groups: Vec<String> = headers
            .get_all(CACHE_GROUP_INVALIDATION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(split_tags)
            .collect();
        if groups.is_empty() {
            return 0;
        }
        let (keys, groups) = self.purge_tags(&groups).await;
        let now = Utc::now();
        for key in &keys {
            self.storages.invalidate(&CacheKey::from(key.as_str()), true, now).await;
        }
        debug!(groups = ?groups, keys = keys.len(), method = %method, "invalidated cache groups");
        groups.len()
    }

    /// Every tag with its keys.
    pub async fn list_tags(&self) -> BTreeMap<String, Vec<String>> {
        self.storages
            .map_keys(SURROGATE_KEY_PREFIX)
            .await
            .into_iter()
            .map(|(tag, raw)| (tag, members(&raw)))
            .collect()
    }

    /// Drops the whole index.
    pub async fn reset(&self) {
        let pattern = format!("^{}", regex::escape(SURROGATE_KEY_PREFIX));
        match Regex::new(&pattern) {
            Ok(pattern) => {
                self.storages.delete_many(&pattern).await;
            }
            Err(error) => warn!(error = ?error, "surrogate reset pattern rejected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn index(name: &str) -> SurrogateIndex {
        SurrogateIndex::new(StorageChain::new(Vec::new()), name, SurrogateConfig::default())
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(name, value)| (HeaderName::from_static(name), HeaderValue::from_static(value)))
            .collect()
    }

    #[test]
    fn first_tag_header_wins() {
        let headers = headers(&[("cache-tags", "ignored"), ("surrogate-key", "a, b c,a")]);
        assert_eq!(parse_tags(&headers), vec!["a", "b", "c"]);
    }

    #[test]
    fn members_round_trip_through_encoding() {
        let key = "GET-example.com-/list?a=1,b=2&c";
        let encoded = encode_member(key);
        assert!(!encoded.contains(MEMBER_SEPARATOR));
        assert_eq!(decode_member(&encoded), key);
    }

    #[test]
    fn no_store_vetoes_unless_targeted_elsewhere() {
        let index = index("Stashbox");
        assert!(index.is_vetoed(&headers(&[("surrogate-control", "max-age=60, no-store")])));
        assert!(index.is_vetoed(&headers(&[("surrogate-control", "no-store;stashbox")])));
        assert!(!index.is_vetoed(&headers(&[("surrogate-control", "no-store;other-cdn")])));
        assert!(!index.is_vetoed(&headers(&[("cache-control", "max-age=60")])));
        assert!(
            !index.is_vetoed(&headers(&[
                ("surrogate-control", "max-age=60"),
                ("cache-control", "no-store")
            ])),
            "only the first present control header is consulted"
        );
    }
}
