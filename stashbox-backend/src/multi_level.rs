//! Multi-representation mapping store.
//!
//! A resource may have several stored representations, one per distinct
//! combination of the request headers named by its `Vary`. Each
//! representation is written as a blob under its varied key, and the base
//! key's mapping (`IDX_<base>`) lists them so a lookup can elect the one
//! matching the incoming request.
//!
//! Writes go blob first, then mapping. A mapping never references a blob
//! that was not written, an orphaned blob expires on its own TTL.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use stashbox_core::{
    CacheKey, CachedEntry, Lookup, MAPPING_KEY_PREFIX, MAX_LIFETIME, Mapping, Revalidator,
    StoredResponse, Variant, VariedHeaders,
};

use crate::codec;
use crate::{BackendResult, Storage};

/// One representation about to be stored.
#[derive(Debug, Clone)]
pub struct VariantWrite {
    pub base: CacheKey,
    /// Varied key the blob is written under.
    pub real_key: String,
    pub varied_headers: VariedHeaders,
    pub response: StoredResponse,
    /// Freshness lifetime.
    pub ttl: Duration,
    /// How long the blob outlives its freshness.
    pub stale: Duration,
    pub now: DateTime<Utc>,
}

impl VariantWrite {
    fn variant(&self) -> Variant {
        let fresh_until = self.now + to_chrono(self.ttl);
        let stale_until = fresh_until + to_chrono(self.stale);
        Variant::new(
            self.real_key.clone(),
            self.varied_headers.clone(),
            self.now,
            fresh_until,
            stale_until,
            self.response.etag().map(str::to_owned),
        )
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_LIFETIME)).unwrap_or_default()
}

fn mapping_ttl(mapping: &Mapping, now: DateTime<Utc>) -> Duration {
    mapping
        .variants()
        .iter()
        .map(Variant::stale_until)
        .max()
        .and_then(|until| (until - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Mapping store operations available on every [`Storage`].
pub trait MultiLevelStorage: Storage {
    /// Reads and decodes the mapping of `base`.
    fn get_mapping(
        &self,
        base: &CacheKey,
    ) -> impl Future<Output = BackendResult<Option<Mapping>>> + Send {
        async move {
            match self.get(&base.mapping_key()).await? {
                Some(raw) => Ok(Some(codec::decode(&raw)?)),
                None => Ok(None),
            }
        }
    }

    /// Elects the fresh and stale representations matching `request`.
    ///
    /// `revalidator` is validated against the elected entry, the fresh one
    /// when both exist. Mapping entries whose blob is gone are skipped.
    fn get_multi_level(
        &self,
        base: &CacheKey,
        request: &HeaderMap,
        revalidator: &mut Revalidator,
        now: DateTime<Utc>,
    ) -> impl Future<Output = BackendResult<Lookup>> + Send {
        async move {
            let Some(mapping) = self.get_mapping(base).await? else {
                return Ok(Lookup::default());
            };
            let election = mapping.elect(request, now);

            let mut lookup = Lookup::default();
            for (variant, fresh) in [(election.fresh, true), (election.stale, false)] {
                let Some(variant) = variant else { continue };
                let Some(raw) = self.get(variant.real_key()).await? else {
                    tracing::trace!(key = variant.real_key(), "mapping references a missing blob");
                    continue;
                };
                let response = codec::decode_blob(self.name(), &raw, self.compressor())?;
                let entry = CachedEntry {
                    variant: variant.clone(),
                    response,
                    storage: self.name().into(),
                };
                if fresh {
                    lookup.fresh = Some(entry);
                } else {
                    lookup.stale = Some(entry);
                }
            }

            if let Some(entry) = lookup.fresh.as_ref().or(lookup.stale.as_ref()) {
                revalidator.validate_etag(entry.response.etag());
                revalidator.validate_last_modified(entry.response.last_modified());
            }
            Ok(lookup)
        }
    }

    /// Writes the blob, then records the variant in the mapping.
    ///
    /// A failed blob write leaves the mapping untouched. Callers serialize
    /// concurrent writes for the same base key.
    fn set_multi_level(&self, write: &VariantWrite) -> impl Future<Output = BackendResult<()>> + Send {
        async move {
            let blob = codec::encode_blob(self.name(), &write.response, self.compressor())?;
            self.set(&write.real_key, blob, write.ttl.saturating_add(write.stale)).await?;

            let mapping_key = write.base.mapping_key();
            let mut mapping = match self.get(&mapping_key).await? {
                Some(raw) => codec::decode::<Mapping>(&raw).unwrap_or_else(|error| {
                    tracing::warn!(key = %mapping_key, error = ?error, "dropping undecodable mapping");
                    Mapping::default()
                }),
                None => Mapping::default(),
            };
            mapping.retain_live(write.now);
            mapping.upsert(write.variant());

            let ttl = mapping_ttl(&mapping, write.now);
            self.set(&mapping_key, codec::encode(&mapping)?, ttl).await
        }
    }

    /// Invalidates every representation of `base`.
    ///
    /// With `purge` the blobs and the mapping are deleted. Otherwise the
    /// variants are only marked stale so they stay available as a
    /// stale-if-error fallback. Returns the number of affected variants.
    fn invalidate_multi_level(
        &self,
        base: &CacheKey,
        purge: bool,
        now: DateTime<Utc>,
    ) -> impl Future<Output = BackendResult<usize>> + Send {
        async move {
            let Some(mut mapping) = self.get_mapping(base).await? else {
                return Ok(0);
            };
            let mapping_key = base.mapping_key();
            if purge {
                for variant in mapping.variants() {
                    self.delete(variant.real_key()).await?;
                }
                self.delete(&mapping_key).await?;
                return Ok(mapping.variants().len());
            }
            let expired = mapping.expire_all(now);
            if expired > 0 {
                let ttl = mapping_ttl(&mapping, now);
                self.set(&mapping_key, codec::encode(&mapping)?, ttl).await?;
            }
            Ok(expired)
        }
    }

    /// Drops variants past their stale boundary from every mapping and
    /// deletes mappings left empty. Returns the number of dropped variants.
    fn purge_expired_mappings(&self, now: DateTime<Utc>) -> impl Future<Output = BackendResult<usize>> + Send {
        async move {
            let mut dropped = 0;
            for (base, raw) in self.map_keys(MAPPING_KEY_PREFIX).await? {
                let key = format!("{MAPPING_KEY_PREFIX}{base}");
                let Ok(mut mapping) = codec::decode::<Mapping>(&raw) else {
                    self.delete(&key).await?;
                    continue;
                };
                let removed = mapping.retain_live(now);
                if removed == 0 {
                    continue;
                }
                dropped += removed;
                if mapping.is_empty() {
                    self.delete(&key).await?;
                } else {
                    let ttl = mapping_ttl(&mapping, now);
                    self.set(&key, codec::encode(&mapping)?, ttl).await?;
                }
            }
            Ok(dropped)
        }
    }
}

impl<T: Storage + ?Sized> MultiLevelStorage for T {}
