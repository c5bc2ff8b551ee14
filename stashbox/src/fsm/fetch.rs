//! One origin round-trip, with classification and storage of its answer.
//!
//! A [`Refresh`] owns everything it needs so it can run on a detached task,
//! either as the leader of a coalesced fetch or as a background
//! stale-while-revalidate pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{
    AGE, CONTENT_LENGTH, DATE, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    IF_UNMODIFIED_SINCE, LAST_MODIFIED, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use smol_str::SmolStr;
use stashbox_backend::VariantWrite;
use stashbox_core::{
    CacheKey, MAX_LIFETIME, RequestCacheControl, ResponseCacheControl, STORED_LENGTH_HEADER,
    STORED_TTL_HEADER, StoredResponse, Upstream, VariedKey, freshness_lifetime,
};
use tracing::{debug, trace, warn};

use super::states::{Answer, FetchFailure, Fetched};
use crate::cache_status::detail;
use crate::cacheability::{self, Storable};
use crate::error::{SharedError, UpstreamError};
use crate::fsm::pipeline::PipelineInner;
use crate::metrics;

/// Request data forwarded to the origin, without client validators.
#[derive(Debug, Clone)]
pub(crate) struct Forward {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Forward {
    pub fn new(parts: &http::request::Parts, body: Bytes) -> Self {
        let mut headers = parts.headers.clone();
        for name in [IF_NONE_MATCH, IF_MATCH, IF_MODIFIED_SINCE, IF_UNMODIFIED_SINCE] {
            headers.remove(name);
        }
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers,
            body,
        }
    }

    /// Builds the origin request, carrying the validators of `stored` if any.
    pub fn request(&self, stored: Option<&StoredResponse>) -> Request<Bytes> {
        let mut request = Request::new(self.body.clone());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();

        if let Some(stored) = stored {
            let headers = request.headers_mut();
            if let Some(etag) = stored.headers().get(http::header::ETAG) {
                headers.insert(IF_NONE_MATCH, etag.clone());
            }
            if let Some(since) = stored
                .headers()
                .get(LAST_MODIFIED)
                .or_else(|| stored.headers().get(DATE))
            {
                headers.insert(IF_MODIFIED_SINCE, since.clone());
            }
        }
        request
    }
}

pub(crate) struct Refresh<U> {
    pub inner: Arc<PipelineInner>,
    pub upstream: U,
    pub forward: Forward,
    pub key: CacheKey,
    pub request_cc: RequestCacheControl,
    pub base_uri: String,
    /// Entry whose validators are sent along.
    pub validated: Option<StoredResponse>,
}

impl<U> Refresh<U>
where
    U: Upstream<Request<Bytes>, Response = Result<Response<Bytes>, UpstreamError>> + Send + 'static,
    U::Future: Send + 'static,
{
    #[tracing::instrument(name = "refresh", skip(self), fields(key = %self.key))]
    pub async fn run(mut self) -> Fetched {
        let request = self.forward.request(self.validated.as_ref());
        let start = Instant::now();
        let call = self.upstream.call(request);
        let result = match self.inner.config.config.timeout.upstream {
            Some(deadline) => match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(deadline = ?deadline, "upstream deadline exceeded");
                    return Fetched::failed(FetchFailure::Deadline(deadline));
                }
            },
            None => call.await,
        };
        metrics::record_upstream(start.elapsed());

        let response = match result {
            Ok(response) => response,
            Err(UpstreamError::Body(error)) => {
                debug!(error = ?error, "upstream body cut short");
                return Fetched::failed(FetchFailure::Body(SharedError::new(error)));
            }
            Err(UpstreamError::Request(error)) => {
                debug!(error = ?error, "upstream request failed");
                return Fetched::failed(FetchFailure::Request(SharedError::new(error)));
            }
        };

        let origin_status = response.status();
        let now = Utc::now();
        let validated = self.validated.take();
        let (response, revalidated) = match validated {
            Some(stored) if origin_status == StatusCode::NOT_MODIFIED => {
                trace!("origin confirmed the stored entry");
                (merge_not_modified(stored, response.headers()), true)
            }
            _ => (StoredResponse::from_response(response), false),
        };

        Fetched {
            result: Ok(self.store(response, origin_status, revalidated, now).await),
        }
    }

    async fn store(
        &mut self,
        mut response: StoredResponse,
        origin_status: StatusCode,
        revalidated: bool,
        now: DateTime<Utc>,
    ) -> Answer {
        let config = &self.inner.config;
        cacheability::apply_default_cache_control(
            response.headers_mut(),
            config.default_cache_control.as_ref(),
        );
        let mut answer = Answer {
            response,
            origin_status,
            revalidated,
            stored: false,
            details: Vec::new(),
            varied_headers: None,
        };

        let storable = match cacheability::classify(
            config,
            &self.forward.headers,
            &self.request_cc,
            &answer.response,
        ) {
            Ok(storable) => storable,
            Err(reason) => {
                trace!(reason, "response not stored");
                answer.details.push(SmolStr::new_static(reason));
                return answer;
            }
        };
        let Storable { cache_control, vary } = storable;

        let ttl = match freshness_lifetime(&cache_control, answer.response.headers(), config.config.ttl, now) {
            Ok(ttl) => ttl,
            Err(error) => {
                debug!(error = %error, "response freshness cannot be computed");
                answer.details.push(SmolStr::new_static(error.detail()));
                return answer;
            }
        };
        let stale = stale_window(config.config.stale, &cache_control);
        if ttl.is_zero() && stale.is_zero() {
            trace!("response has no lifetime");
            return answer;
        }

        let prepared = cacheability::prepare(answer.response.clone(), &cache_control, ttl, now);
        let (real_key, varied_headers) = VariedKey::compute(&self.key, &vary, &self.forward.headers);
        let write = VariantWrite {
            base: self.key.clone(),
            real_key: real_key.into_string(),
            varied_headers: varied_headers.clone(),
            response: prepared,
            ttl,
            stale,
            now,
        };

        let report = self.inner.storages.store(&write).await;
        for failed in &report.failed {
            answer.details.push(detail::insertion_error(failed).into());
        }
        if !report.is_stored() {
            warn!(key = %self.key, failed = ?report.failed, "response could not be stored anywhere");
            return answer;
        }

        if self.inner.surrogates.is_enabled() {
            self.inner
                .surrogates
                .store(write.response.headers(), &self.key, &self.base_uri)
                .await;
        }
        answer.stored = true;
        answer.varied_headers = Some(varied_headers);
        answer.response = write.response;
        answer
    }
}

/// How long an entry outlives its freshness.
///
/// Stale directives of the response extend the configured window, capped at
/// [`MAX_LIFETIME`].
fn stale_window(configured: Duration, cc: &ResponseCacheControl) -> Duration {
    let declared = cc
        .stale_while_revalidate
        .into_iter()
        .chain(cc.stale_if_error)
        .max()
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);
    configured.max(declared).min(MAX_LIFETIME)
}

/// Refreshes a stored response with the headers of a `304 Not Modified`.
fn merge_not_modified(mut stored: StoredResponse, fresh: &HeaderMap) -> StoredResponse {
    let headers = stored.headers_mut();
    for name in [DATE, AGE, STORED_TTL_HEADER] {
        headers.remove(name);
    }
    for name in fresh.keys() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == STORED_LENGTH_HEADER {
            continue;
        }
        headers.remove(name);
        for value in fresh.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    stored
}

/// Headers kept on a bare `304 Not Modified`.
pub(crate) fn bare_validators(stored: &StoredResponse) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in [
        http::header::ETAG,
        LAST_MODIFIED,
        http::header::CACHE_CONTROL,
        http::header::EXPIRES,
        http::header::VARY,
        http::header::CONTENT_LOCATION,
        DATE,
    ] {
        if let Some(value) = stored.headers().get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CACHE_CONTROL, ETAG, HeaderValue};
    use pretty_assertions::assert_eq;

    fn stored() -> StoredResponse {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=10"));
        headers.insert(DATE, HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        headers.insert(STORED_TTL_HEADER, HeaderValue::from_static("10"));
        StoredResponse::new(StatusCode::OK, headers, Bytes::from_static(b"hello"))
    }

    #[test]
    fn forwarded_requests_carry_stored_validators_only() {
        let request = Request::get("http://example.com/a")
            .header(IF_NONE_MATCH, "\"client\"")
            .header(IF_UNMODIFIED_SINCE, "Sun, 06 Nov 1994 08:49:37 GMT")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();
        let forward = Forward::new(&parts, Bytes::new());

        let plain = forward.request(None);
        assert!(!plain.headers().contains_key(IF_NONE_MATCH));
        assert!(!plain.headers().contains_key(IF_UNMODIFIED_SINCE));

        let conditional = forward.request(Some(&stored()));
        assert_eq!(conditional.headers()[IF_NONE_MATCH], "\"v1\"");
        assert_eq!(
            conditional.headers()[IF_MODIFIED_SINCE],
            "Sun, 06 Nov 1994 08:49:37 GMT",
            "Date stands in for a missing Last-Modified"
        );
    }

    #[test]
    fn not_modified_refreshes_metadata_and_keeps_the_body() {
        let mut fresh = HeaderMap::new();
        fresh.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        fresh.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        let merged = merge_not_modified(stored(), &fresh);

        assert_eq!(merged.status(), StatusCode::OK);
        assert_eq!(merged.body(), &Bytes::from_static(b"hello"));
        assert_eq!(merged.headers()[CACHE_CONTROL], "max-age=60");
        assert_eq!(merged.headers()[CONTENT_LENGTH], "5");
        assert!(!merged.headers().contains_key(DATE), "the old Date would age the entry");
        assert!(!merged.headers().contains_key(STORED_TTL_HEADER));
    }

    #[test]
    fn stale_directives_extend_the_configured_window() {
        let cc = ResponseCacheControl {
            stale_while_revalidate: Some(30),
            stale_if_error: Some(90),
            ..Default::default()
        };
        assert_eq!(stale_window(Duration::from_secs(10), &cc), Duration::from_secs(90));
        assert_eq!(
            stale_window(Duration::from_secs(600), &cc),
            Duration::from_secs(600)
        );
        assert_eq!(
            stale_window(Duration::ZERO, &ResponseCacheControl::default()),
            Duration::ZERO
        );
    }

    #[test]
    fn huge_stale_directives_are_capped() {
        let cc = ResponseCacheControl {
            stale_while_revalidate: Some(u64::MAX),
            ..Default::default()
        };
        assert_eq!(stale_window(Duration::from_secs(10), &cc), MAX_LIFETIME);
        assert_eq!(stale_window(Duration::MAX, &cc), MAX_LIFETIME);
    }
}
