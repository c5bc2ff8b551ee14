use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use http::header::{CONNECTION, CONTENT_LENGTH, HeaderValue, UPGRADE};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use stashbox_backend::{Storage, StorageChain};
use stashbox_core::{
    CacheKey, CachedEntry, Decision, DecisionConfig, RequestCacheControl, Revalidator,
    STORED_LENGTH_HEADER, STORED_TTL_HEADER, StoredResponse, Upstream, age, decide_action, key,
};
use tracing::{debug, trace, warn};

use super::fetch::{Forward, Refresh, bare_validators};
use super::states::{FetchFailure, Fetched, Revalidation, State};
use crate::cache_status::{CacheStatus, Outcome, detail};
use crate::cacheability::is_upstream_error;
use crate::coalescing::Coalescer;
use crate::config::{CacheConfig, CompiledConfig};
use crate::error::{CacheError, CoalescingError, UpstreamError};
use crate::metrics;
use crate::offload::OffloadManager;
use crate::surrogate::SurrogateIndex;

pub(crate) struct PipelineInner {
    pub config: CompiledConfig,
    pub storages: StorageChain,
    pub offload: OffloadManager,
    pub coalescer: Coalescer<Fetched>,
    pub surrogates: SurrogateIndex,
}

/// The cache in front of an origin.
///
/// Clones share storages, in-flight fetches and background tasks.
#[derive(Clone)]
pub struct CachePipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for CachePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePipeline")
            .field("name", &self.inner.config.config.name)
            .field("storages", &self.inner.storages)
            .finish()
    }
}

/// Everything derived from the inbound request once.
struct RequestContext {
    parts: Parts,
    body: Bytes,
    key: CacheKey,
    hide_key: bool,
    request_cc: RequestCacheControl,
    revalidator: Revalidator,
    base_uri: String,
}

impl RequestContext {
    fn status(&self, name: &str, outcome: Outcome) -> CacheStatus {
        let status = CacheStatus::new(name, outcome);
        if self.hide_key {
            status
        } else {
            status.key(self.key.as_str())
        }
    }
}

impl CachePipeline {
    /// Starts a [`CachePipelineBuilder`].
    pub fn builder() -> CachePipelineBuilder {
        CachePipelineBuilder::default()
    }

    /// The validated configuration.
    pub fn config(&self) -> &CompiledConfig {
        &self.inner.config
    }

    /// Storages in lookup order.
    pub fn storages(&self) -> &StorageChain {
        &self.inner.storages
    }

    /// The surrogate-key index.
    pub fn surrogates(&self) -> &SurrogateIndex {
        &self.inner.surrogates
    }

    /// Background task manager.
    pub fn offload(&self) -> &OffloadManager {
        &self.inner.offload
    }

    fn name(&self) -> &str {
        &self.inner.config.config.name
    }

    /// Answers `request` from storage or through `upstream`.
    ///
    /// Every response carries a `Cache-Status` header. An `Err` is returned
    /// only when the origin failed and nothing stored could stand in.
    pub async fn handle<U>(
        &self,
        request: Request<Bytes>,
        upstream: U,
    ) -> Result<Response<Bytes>, CacheError>
    where
        U: Upstream<Request<Bytes>, Response = Result<Response<Bytes>, UpstreamError>>
            + Clone
            + Send
            + 'static,
        U::Future: Send + 'static,
    {
        let start = Instant::now();
        let (parts, body) = request.into_parts();
        let (ctx, mut state) = self.prepare(parts, body);

        loop {
            trace!(key = %ctx.key, state = ?state, "transition");
            state = match state {
                State::Bypass { reason } => {
                    let upstream = upstream.clone();
                    self.bypass(&ctx, reason, upstream).await?
                }
                State::Lookup => self.lookup(&ctx).await,
                State::ServeHit {
                    entry,
                    not_modified,
                } => self.serve_hit(&ctx, entry, not_modified),
                State::Revalidating(revalidation) => State::Upstream {
                    revalidation: Some(revalidation),
                },
                State::ServingStale {
                    entry,
                    refresh,
                    detail,
                    fwd_status,
                } => {
                    if refresh {
                        self.refresh_in_background(&ctx, &entry, upstream.clone());
                    }
                    self.serve_stale(&ctx, entry, detail, fwd_status)
                }
                State::Upstream { revalidation } => {
                    let upstream = upstream.clone();
                    self.fetch(&ctx, revalidation, upstream).await?
                }
                State::Store {
                    fetched,
                    revalidation,
                } => self.complete(&ctx, fetched, revalidation)?,
                State::Done {
                    mut response,
                    status,
                    storage,
                } => {
                    status.apply(response.headers_mut());
                    metrics::record_outcome(
                        status.outcome(),
                        storage.as_deref().unwrap_or_default(),
                        start.elapsed(),
                    );
                    return Ok(response);
                }
            };
        }
    }

    fn prepare(&self, parts: Parts, body: Bytes) -> (RequestContext, State) {
        let config = &self.inner.config;
        let request_uri = key::request_uri(&parts, false);
        let digest = key::body_digest(&body);
        let cache_key = config.keys.compute(&parts, digest.as_deref());
        let hide_key = config.keys.is_hidden(&request_uri);
        let parsed_cc = RequestCacheControl::parse(&parts.headers);

        let reason = if is_upgrade(&parts) || config.is_excluded(&request_uri) {
            Some(detail::EXCLUDED_REQUEST_URI)
        } else if !config.is_allowed(&parts.method) {
            Some(detail::UNSUPPORTED_METHOD)
        } else if key::is_graphql_mutation(&body) {
            Some(detail::IS_MUTATION_REQUEST)
        } else {
            match &parsed_cc {
                Err(_) => Some(detail::CACHE_CONTROL_EXTRACTION_ERROR),
                Ok(cc) if cc.no_store && !config.config.mode.ignores_request() => {
                    Some(detail::NO_STORE_DIRECTIVE)
                }
                Ok(_) => None,
            }
        };

        let ctx = RequestContext {
            revalidator: Revalidator::from_request(&parts.headers),
            base_uri: key::request_uri(&parts, true),
            request_cc: parsed_cc.unwrap_or_default(),
            key: cache_key,
            hide_key,
            parts,
            body,
        };
        let state = match reason {
            Some(reason) => State::Bypass { reason },
            None => State::Lookup,
        };
        (ctx, state)
    }

    async fn bypass<U>(
        &self,
        ctx: &RequestContext,
        reason: &'static str,
        mut upstream: U,
    ) -> Result<State, CacheError>
    where
        U: Upstream<Request<Bytes>, Response = Result<Response<Bytes>, UpstreamError>>,
    {
        let request = rebuild(&ctx.parts, ctx.body.clone());
        let call = upstream.call(request);
        let start = Instant::now();
        let result = match self.inner.config.config.timeout.upstream {
            Some(deadline) => match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => return Ok(self.deadline_exceeded(ctx, deadline)),
            },
            None => call.await,
        };
        metrics::record_upstream(start.elapsed());

        let response = match result {
            Ok(response) => response,
            Err(UpstreamError::Body(error)) => {
                debug!(key = %ctx.key, error = ?error, "bypassed response body cut short");
                return Ok(self.synthesized(
                    ctx,
                    StatusCode::BAD_GATEWAY,
                    Outcome::Bypass,
                    &[reason, detail::BROKEN_PIPE],
                ));
            }
            Err(UpstreamError::Request(error)) => return Err(CacheError::Upstream(error)),
        };

        if !ctx.parts.method.is_safe() {
            self.invalidate_after_mutation(ctx, &response).await;
        }

        let status = ctx
            .status(self.name(), Outcome::Bypass)
            .fwd_status(response.status())
            .detail(reason);
        Ok(State::Done {
            response,
            status,
            storage: None,
        })
    }

    /// Drops what an unsafe request may have changed.
    ///
    /// Groups named by `Cache-Group-Invalidation` are purged and, on success,
    /// the stored `GET` representations of the target URI are marked stale.
    async fn invalidate_after_mutation(&self, ctx: &RequestContext, response: &Response<Bytes>) {
        self.inner
            .surrogates
            .invalidate(&ctx.parts.method, response.headers())
            .await;
        if response.status().is_success() || response.status().is_redirection() {
            let mut target = rebuild(&ctx.parts, Bytes::new()).into_parts().0;
            target.method = Method::GET;
            let target_key = self.inner.config.keys.compute(&target, None);
            let affected = self
                .inner
                .storages
                .invalidate(&target_key, false, Utc::now())
                .await;
            if affected > 0 {
                debug!(key = %target_key, affected, method = %ctx.parts.method, "invalidated after unsafe request");
            }
        }
    }

    async fn lookup(&self, ctx: &RequestContext) -> State {
        let now = Utc::now();
        let mut revalidator = ctx.revalidator.clone();
        let mut lookup = self
            .inner
            .storages
            .lookup(&ctx.key, &ctx.parts.headers, &mut revalidator, now)
            .await;
        let decision = decide_action(
            &ctx.request_cc,
            &lookup,
            &revalidator,
            DecisionConfig {
                bypass_request: self.inner.config.config.mode.ignores_request(),
            },
            now,
        );
        debug!(key = %ctx.key, decision = ?decision, "cache lookup");

        let only_if_cached_miss = ctx.request_cc.only_if_cached
            && matches!(decision, Decision::Miss | Decision::Revalidate { .. });
        if only_if_cached_miss {
            return self.synthesized(
                ctx,
                StatusCode::GATEWAY_TIMEOUT,
                Outcome::UriMiss,
                &[detail::ONLY_IF_CACHED_MISS],
            );
        }

        let fresh = lookup.fresh.take();
        let stale = lookup.stale.take();
        match (decision, fresh, stale) {
            (Decision::ServeFresh, Some(entry), _) => State::ServeHit {
                entry,
                not_modified: false,
            },
            (Decision::ServeNotModified, Some(entry), _) => State::ServeHit {
                entry,
                not_modified: true,
            },
            (Decision::Revalidate { stale_fallback }, fresh, stale) => match fresh.or(stale) {
                Some(entry) => State::Revalidating(Revalidation {
                    entry,
                    stale_fallback,
                }),
                None => State::Upstream { revalidation: None },
            },
            // only-if-cached forbids contacting the origin, even in the background.
            (Decision::ServeStaleWhileRevalidating, _, Some(entry)) => State::ServingStale {
                entry,
                refresh: !ctx.request_cc.only_if_cached,
                detail: None,
                fwd_status: None,
            },
            (Decision::ServeStaleOnError, _, Some(entry)) => State::ServingStale {
                entry,
                refresh: false,
                detail: None,
                fwd_status: None,
            },
            _ => State::Upstream { revalidation: None },
        }
    }

    fn serve_hit(&self, ctx: &RequestContext, entry: CachedEntry, not_modified: bool) -> State {
        let now = Utc::now();
        let (served, ttl) = served_entry(&entry.response, now);
        let response = if not_modified {
            not_modified_response(&served)
        } else {
            served.into_response()
        };
        let status = ctx
            .status(self.name(), Outcome::Hit)
            .ttl(ttl)
            .detail(entry.storage.to_ascii_uppercase());
        State::Done {
            response,
            status,
            storage: Some(entry.storage.to_string()),
        }
    }

    fn serve_stale(
        &self,
        ctx: &RequestContext,
        entry: CachedEntry,
        reason: Option<&'static str>,
        fwd_status: Option<StatusCode>,
    ) -> State {
        let now = Utc::now();
        let (served, ttl) = served_entry(&entry.response, now);
        let staleness = i64::try_from(entry.variant.staleness(now)).unwrap_or(i64::MAX);
        let mut status = ctx
            .status(self.name(), Outcome::Stale)
            .ttl(ttl.min(-staleness))
            .detail(entry.storage.to_ascii_uppercase());
        if let Some(reason) = reason {
            status = status.detail(reason);
        }
        if let Some(fwd_status) = fwd_status {
            status = status.fwd_status(fwd_status);
        }
        State::Done {
            response: served.into_response(),
            status,
            storage: Some(entry.storage.to_string()),
        }
    }

    fn refresh<U>(&self, ctx: &RequestContext, validated: Option<StoredResponse>, upstream: U) -> Refresh<U> {
        Refresh {
            inner: self.inner.clone(),
            upstream,
            forward: Forward::new(&ctx.parts, ctx.body.clone()),
            key: ctx.key.clone(),
            request_cc: ctx.request_cc.clone(),
            base_uri: ctx.base_uri.clone(),
            validated,
        }
    }

    /// Spawns a stale-while-revalidate pass for the entry being served.
    fn refresh_in_background<U>(&self, ctx: &RequestContext, entry: &CachedEntry, upstream: U)
    where
        U: Upstream<Request<Bytes>, Response = Result<Response<Bytes>, UpstreamError>>
            + Send
            + 'static,
        U::Future: Send + 'static,
    {
        let refresh = self.refresh(ctx, Some(entry.response.clone()), upstream);
        let coalescer = self.inner.coalescer.clone();
        let key = ctx.key.clone();
        let task_key = key.clone();
        let spawned = self.inner.offload.spawn_refresh(task_key, async move {
            if let Err(error) = coalescer.run(&key, move || refresh.run()).await {
                debug!(key = %key, error = %error, "background revalidation did not complete");
            }
        });
        if !spawned {
            trace!(key = %ctx.key, "background revalidation already running");
        }
    }

    /// Asks the origin through the coalescing layer.
    async fn fetch<U>(
        &self,
        ctx: &RequestContext,
        revalidation: Option<Revalidation>,
        upstream: U,
    ) -> Result<State, CacheError>
    where
        U: Upstream<Request<Bytes>, Response = Result<Response<Bytes>, UpstreamError>>
            + Clone
            + Send
            + 'static,
        U::Future: Send + 'static,
    {
        let validated = revalidation.as_ref().map(|r| r.entry.response.clone());
        let coalescer = &self.inner.coalescer;

        let mut attempts = 0;
        let fetched = loop {
            attempts += 1;
            let mut led = false;
            let refresh = self.refresh(ctx, validated.clone(), upstream.clone());
            let result = coalescer
                .run(&ctx.key, || {
                    led = true;
                    refresh.run()
                })
                .await;

            match result {
                Ok(fetched) if led || fetched.is_shareable_with(&ctx.parts.headers) => break fetched,
                Ok(_) => {
                    trace!(key = %ctx.key, "coalesced answer does not fit this request");
                    break self
                        .refresh(ctx, validated.clone(), upstream.clone())
                        .run()
                        .await;
                }
                Err(CoalescingError::Timeout(timeout)) => {
                    warn!(key = %ctx.key, timeout = ?timeout, "coalesced fetch timed out");
                    return Ok(self.synthesized(
                        ctx,
                        StatusCode::GATEWAY_TIMEOUT,
                        Outcome::UriMiss,
                        &[detail::COALESCING_TIMEOUT],
                    ));
                }
                Err(CoalescingError::Abandoned) if attempts < 2 => {
                    debug!(key = %ctx.key, "coalesced fetch abandoned, retrying as leader");
                }
                Err(error) => return Err(error.into()),
            }
        };

        Ok(State::Store {
            fetched,
            revalidation,
        })
    }

    /// Renders the answer of an origin round-trip.
    fn complete(
        &self,
        ctx: &RequestContext,
        fetched: Fetched,
        revalidation: Option<Revalidation>,
    ) -> Result<State, CacheError> {
        let fallback = revalidation
            .as_ref()
            .filter(|r| r.stale_fallback)
            .map(|r| r.entry.clone());

        let answer = match fetched.result {
            Ok(answer) => answer,
            Err(failure) => {
                if let Some(entry) = fallback {
                    let reason = match failure {
                        FetchFailure::Body(_) => detail::BROKEN_PIPE,
                        FetchFailure::Deadline(_) => detail::DEADLINE_EXCEEDED,
                        FetchFailure::Request(_) => detail::UPSTREAM_ERROR,
                    };
                    return Ok(State::ServingStale {
                        entry,
                        refresh: false,
                        detail: Some(reason),
                        fwd_status: None,
                    });
                }
                return match failure {
                    FetchFailure::Deadline(deadline) => Ok(self.deadline_exceeded(ctx, deadline)),
                    FetchFailure::Body(_) => Ok(self.synthesized(
                        ctx,
                        StatusCode::BAD_GATEWAY,
                        outcome_of(&revalidation),
                        &[detail::BROKEN_PIPE],
                    )),
                    FetchFailure::Request(_) if revalidation.is_some() => Ok(self.synthesized(
                        ctx,
                        StatusCode::GATEWAY_TIMEOUT,
                        Outcome::Request,
                        &[detail::UPSTREAM_ERROR],
                    )),
                    FetchFailure::Request(error) => Err(CacheError::Upstream(Box::new(error))),
                };
            }
        };

        if is_upstream_error(answer.origin_status) {
            if let Some(entry) = fallback {
                return Ok(State::ServingStale {
                    entry,
                    refresh: false,
                    detail: Some(detail::UPSTREAM_ERROR),
                    fwd_status: Some(answer.origin_status),
                });
            }
        }

        let mut status = ctx
            .status(self.name(), outcome_of(&revalidation))
            .fwd_status(answer.origin_status);
        if revalidation.is_some() {
            status = status.detail(detail::REQUEST_REVALIDATION);
        }
        for reason in &answer.details {
            status = status.detail(reason.clone());
        }
        let status = status.stored(answer.stored);

        let changed = revalidation.is_some() && !answer.revalidated;
        if changed && ctx.revalidator.if_unmodified_since.is_some() {
            return Ok(State::Done {
                response: empty_response(StatusCode::PRECONDITION_FAILED),
                status,
                storage: None,
            });
        }

        let (served, _) = served_entry(&answer.response, Utc::now());
        let response = match client_precondition(&ctx.revalidator, &served) {
            Some(StatusCode::NOT_MODIFIED) => not_modified_response(&served),
            Some(code) => empty_response(code),
            None => served.into_response(),
        };
        Ok(State::Done {
            response,
            status,
            storage: None,
        })
    }

    fn deadline_exceeded(&self, ctx: &RequestContext, deadline: std::time::Duration) -> State {
        let mut response = empty_response(StatusCode::GATEWAY_TIMEOUT);
        let body = Bytes::from(CacheError::DeadlineExceeded(deadline).to_string());
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        *response.body_mut() = body;
        State::Done {
            response,
            status: ctx
                .status(self.name(), Outcome::Bypass)
                .detail(detail::DEADLINE_EXCEEDED),
            storage: None,
        }
    }

    fn synthesized(
        &self,
        ctx: &RequestContext,
        code: StatusCode,
        outcome: Outcome,
        details: &[&'static str],
    ) -> State {
        let status = details
            .iter()
            .fold(ctx.status(self.name(), outcome), |status, reason| status.detail(*reason));
        State::Done {
            response: empty_response(code),
            status,
            storage: None,
        }
    }
}

fn outcome_of(revalidation: &Option<Revalidation>) -> Outcome {
    if revalidation.is_some() {
        Outcome::Request
    } else {
        Outcome::UriMiss
    }
}

fn is_upgrade(parts: &Parts) -> bool {
    parts.headers.contains_key(UPGRADE)
        || parts
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
}

fn rebuild(parts: &Parts, body: Bytes) -> Request<Bytes> {
    let mut request = Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    request
}

/// A stored response as served, without internal headers, with its
/// remaining freshness in seconds.
fn served_entry(stored: &StoredResponse, now: chrono::DateTime<Utc>) -> (StoredResponse, i64) {
    let mut served = stored.clone();
    let stored_ttl = age::stored_ttl(served.headers()).unwrap_or(0);
    served.headers_mut().remove(STORED_TTL_HEADER);
    served.headers_mut().remove(STORED_LENGTH_HEADER);
    let age = age::refresh_age(served.headers_mut(), now);
    let ttl = i64::try_from(stored_ttl).unwrap_or(i64::MAX) - i64::try_from(age).unwrap_or(i64::MAX);
    (served, ttl)
}

fn not_modified_response(served: &StoredResponse) -> Response<Bytes> {
    let mut response = empty_response(StatusCode::NOT_MODIFIED);
    response.headers_mut().extend(bare_validators(served));
    response
}

fn empty_response(code: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = code;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

/// Evaluates the client's own conditional headers against a response.
fn client_precondition(revalidator: &Revalidator, served: &StoredResponse) -> Option<StatusCode> {
    if !revalidator.is_conditional() || !served.status().is_success() {
        return None;
    }
    let mut revalidator = revalidator.clone();
    revalidator.validate_etag(served.etag());
    revalidator.validate_last_modified(served.last_modified());
    if let Some(since) = revalidator.if_unmodified_since {
        if served.last_modified().is_none_or(|modified| modified > since) {
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    }
    if !revalidator.if_match.is_empty() && !revalidator.matched {
        return Some(StatusCode::PRECONDITION_FAILED);
    }
    revalidator.not_modified.then_some(StatusCode::NOT_MODIFIED)
}

/// Builds a [`CachePipeline`].
#[derive(Default)]
pub struct CachePipelineBuilder {
    config: Option<CacheConfig>,
    storages: Vec<Arc<dyn Storage>>,
    offload: Option<OffloadManager>,
}

impl CachePipelineBuilder {
    /// Sets the configuration, defaults apply otherwise.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Appends a storage, storages are consulted in insertion order.
    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storages.push(Arc::new(storage));
        self
    }

    /// Appends a storage shared with other pipelines.
    pub fn shared_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storages.push(storage);
        self
    }

    /// Uses `offload` for background revalidation.
    pub fn offload_manager(mut self, offload: OffloadManager) -> Self {
        self.offload = Some(offload);
        self
    }

    /// Validates the configuration and assembles the pipeline.
    pub fn build(self) -> Result<CachePipeline, CacheError> {
        if self.storages.is_empty() {
            return Err(CacheError::Config("at least one storage is required".to_owned()));
        }
        let config = self.config.unwrap_or_default().compile()?;
        let storages = StorageChain::new(self.storages).with_read_timeout(config.config.timeout.backend);
        let surrogates = SurrogateIndex::new(
            storages.clone(),
            config.config.name.clone(),
            config.config.surrogate.clone(),
        );
        let coalescer = Coalescer::new(config.config.coalescing.clone());
        Ok(CachePipeline {
            inner: Arc::new(PipelineInner {
                offload: self.offload.unwrap_or_default(),
                config,
                storages,
                coalescer,
                surrogates,
            }),
        })
    }
}
