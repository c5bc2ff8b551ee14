//! Multi-representation mapping model.
//!
//! Every base key owns one [`Mapping`]: the ordered list of its [`Variant`]s.
//! Each variant points at the blob stored under its real (varied) key and
//! carries the freshness window shared by that blob.
//!
//! ```text
//! IDX_GET-example.com-/      ->  Mapping
//!                                 ├── Variant { real_key: "GET-example.com-/{-VARY-}accept:text/html", .. }
//!                                 └── Variant { real_key: "GET-example.com-/{-VARY-}accept:application/json", .. }
//! ```

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::response::StoredResponse;
use crate::vary::{self, VariedHeaders};

/// One cached representation of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    real_key: String,
    varied_headers: VariedHeaders,
    stored_at: DateTime<Utc>,
    fresh_until: DateTime<Utc>,
    stale_until: DateTime<Utc>,
    etag: Option<String>,
}

impl Variant {
    /// Creates a variant, clamping `stale_until` so it is never before `fresh_until`.
    pub fn new(
        real_key: impl Into<String>,
        varied_headers: VariedHeaders,
        stored_at: DateTime<Utc>,
        fresh_until: DateTime<Utc>,
        stale_until: DateTime<Utc>,
        etag: Option<String>,
    ) -> Self {
        Self {
            real_key: real_key.into(),
            varied_headers,
            stored_at,
            fresh_until,
            stale_until: stale_until.max(fresh_until),
            etag,
        }
    }

    pub fn real_key(&self) -> &str {
        &self.real_key
    }

    pub fn varied_headers(&self) -> &[(String, String)] {
        &self.varied_headers
    }

    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    pub fn fresh_until(&self) -> DateTime<Utc> {
        self.fresh_until
    }

    pub fn stale_until(&self) -> DateTime<Utc> {
        self.stale_until
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Servable without revalidation.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.fresh_until
    }

    /// Not yet past the hard eviction boundary.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.stale_until
    }

    /// Whole seconds elapsed since the variant turned stale.
    pub fn staleness(&self, now: DateTime<Utc>) -> u64 {
        crate::age::apparent_age(self.fresh_until, now)
    }

    /// Seconds of freshness left, rounded up like ages.
    pub fn remaining_freshness(&self, now: DateTime<Utc>) -> u64 {
        crate::age::apparent_age(now, self.fresh_until)
    }

    /// The request carries the same values for every varied header.
    pub fn matches(&self, request: &HeaderMap) -> bool {
        vary::matches(&self.varied_headers, request)
    }

    /// Ends freshness at `now`, keeping the stale window.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.fresh_until = self.fresh_until.min(now);
    }
}

/// Ordered set of variants owned by one base key, most recently written last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    variants: Vec<Variant>,
}

/// Variants elected for a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Election<'a> {
    pub fresh: Option<&'a Variant>,
    pub stale: Option<&'a Variant>,
}

impl Mapping {
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Inserts `variant`, superseding any variant with the same real key.
    ///
    /// The new variant always becomes the most recent one.
    pub fn upsert(&mut self, variant: Variant) {
        self.variants.retain(|v| v.real_key != variant.real_key);
        self.variants.push(variant);
    }

    /// Removes the variant stored under `real_key`.
    pub fn remove(&mut self, real_key: &str) -> Option<Variant> {
        let idx = self.variants.iter().position(|v| v.real_key == real_key)?;
        Some(self.variants.remove(idx))
    }

    /// Drops variants past their stale boundary, returning how many were removed.
    pub fn retain_live(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.variants.len();
        self.variants.retain(|v| v.is_live(now));
        before - self.variants.len()
    }

    /// Marks every variant stale, returning how many were fresh.
    pub fn expire_all(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for variant in &mut self.variants {
            if variant.is_fresh(now) {
                variant.expire(now);
                expired += 1;
            }
        }
        expired
    }

    /// Picks at most one fresh and one stale variant matching the request.
    ///
    /// Every variant is scanned since several may be live at once, the most
    /// recently written match wins in each category.
    pub fn elect(&self, request: &HeaderMap, now: DateTime<Utc>) -> Election<'_> {
        let mut election = Election::default();
        for variant in self.variants.iter().rev() {
            if !variant.is_live(now) || !variant.matches(request) {
                continue;
            }
            if variant.is_fresh(now) {
                election.fresh.get_or_insert(variant);
            } else {
                election.stale.get_or_insert(variant);
            }
            if election.fresh.is_some() && election.stale.is_some() {
                break;
            }
        }
        election
    }
}

/// A stored response loaded through an elected variant.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub variant: Variant,
    pub response: StoredResponse,
    /// Name of the storage the entry was read from.
    pub storage: SmolStr,
}

/// Result of a multi-level lookup.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    pub fresh: Option<CachedEntry>,
    pub stale: Option<CachedEntry>,
}

impl Lookup {
    /// Neither a fresh nor a stale entry was found.
    pub fn is_empty(&self) -> bool {
        self.fresh.is_none() && self.stale.is_none()
    }
}
