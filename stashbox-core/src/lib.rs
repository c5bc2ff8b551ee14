//! # stashbox-core
//!
//! Protocol core of the stashbox HTTP response cache.
//!
//! Everything here is synchronous and storage-agnostic:
//!
//! - **Keys**: base cache keys and their per-route overrides ([`KeyRules`])
//! - **Vary**: varied keys and their round-trippable encoding ([`VariedKey`])
//! - **Directives**: request and response `Cache-Control` ([`RequestCacheControl`], [`ResponseCacheControl`])
//! - **Validators**: conditional request evaluation ([`Revalidator`])
//! - **Mappings**: the variant list of a base key ([`Mapping`])
//! - **Freshness**: the serve-or-revalidate decision ([`decide_action`])
//!
//! Storage lives in `stashbox-backend`, the request pipeline in `stashbox`.

pub mod age;
pub mod directives;
pub mod freshness;
pub mod key;
pub mod mapping;
pub mod response;
pub mod revalidator;
pub mod upstream;
pub mod vary;

pub use age::{MalformedDate, STORED_LENGTH_HEADER, STORED_TTL_HEADER};
pub use directives::{DirectiveError, MaxStale, RequestCacheControl, ResponseCacheControl};
pub use freshness::{
    Decision, DecisionConfig, FreshnessError, MAX_LIFETIME, decide_action, freshness_lifetime,
};
pub use key::{CacheKey, KeyConfig, KeyRules, MAPPING_KEY_PREFIX, SURROGATE_KEY_PREFIX};
pub use mapping::{CachedEntry, Election, Lookup, Mapping, Variant};
pub use response::StoredResponse;
pub use revalidator::Revalidator;
pub use upstream::Upstream;
pub use vary::{VARY_SEPARATOR, Vary, VariedHeaders, VariedKey};

#[doc(hidden)]
pub use smol_str::SmolStr;
