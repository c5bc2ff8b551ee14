//! Scripted origin and storages for pipeline tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response, StatusCode};
use regex::Regex;
use stashbox::cache_status::CACHE_STATUS;
use stashbox::{CacheConfig, CachePipeline, Upstream, UpstreamError};
use stashbox_backend::{BackendError, BackendResult, DeleteStatus, Storage};
use stashbox_moka::MokaStorage;

type Responder = dyn Fn(&Request<Bytes>, usize) -> Result<Response<Bytes>, UpstreamError> + Send + Sync;

/// Origin answering from a closure, counting calls.
///
/// The closure receives the request and the zero-based call number.
#[derive(Clone)]
pub struct Origin {
    calls: Arc<AtomicUsize>,
    responder: Arc<Responder>,
    delay: Duration,
    seen: Arc<std::sync::Mutex<Vec<HeaderMap>>>,
}

impl Origin {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Request<Bytes>, usize) -> Result<Response<Bytes>, UpstreamError> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            responder: Arc::new(responder),
            delay: Duration::ZERO,
            seen: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Always answers `200` with `body` and the given headers.
    pub fn fixed(headers: &[(&'static str, &'static str)], body: &'static str) -> Self {
        let headers = headers.to_vec();
        Self::new(move |_, _| Ok(response(StatusCode::OK, &headers, body)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request headers of every call, in order.
    pub fn seen(&self) -> Vec<HeaderMap> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

impl Upstream<Request<Bytes>> for Origin {
    type Response = Result<Response<Bytes>, UpstreamError>;
    type Future = BoxFuture<'static, Self::Response>;

    fn call(&mut self, req: Request<Bytes>) -> Self::Future {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(req.headers().clone());
        }
        let responder = self.responder.clone();
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            responder(&req, call)
        })
    }
}

pub fn response(status: StatusCode, headers: &[(&'static str, &'static str)], body: &'static str) -> Response<Bytes> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::from_static(body.as_bytes())).unwrap()
}

pub fn get(uri: &str) -> Request<Bytes> {
    request("GET", uri, &[])
}

pub fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> Request<Bytes> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::HOST, "example.com");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::new()).unwrap()
}

pub fn cache_status(response: &Response<Bytes>) -> String {
    response
        .headers()
        .get(CACHE_STATUS)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

pub fn memory() -> MokaStorage {
    MokaStorage::builder().max_entries(1_000).name("MEMORY").build()
}

pub fn pipeline(config: CacheConfig) -> (CachePipeline, MokaStorage) {
    let storage = memory();
    let pipeline = CachePipeline::builder()
        .config(config)
        .storage(storage.clone())
        .build()
        .unwrap();
    (pipeline, storage)
}

fn simulated() -> BackendError {
    BackendError::InternalError(Box::new(std::io::Error::other("simulated error")))
}

/// Storage that fails every operation.
#[derive(Clone, Default)]
pub struct ErrorStorage;

#[async_trait]
impl Storage for ErrorStorage {
    async fn get(&self, _key: &str) -> BackendResult<Option<Bytes>> {
        Err(simulated())
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> BackendResult<()> {
        Err(simulated())
    }

    async fn delete(&self, _key: &str) -> BackendResult<DeleteStatus> {
        Err(simulated())
    }

    async fn delete_many(&self, _pattern: &Regex) -> BackendResult<DeleteStatus> {
        Err(simulated())
    }

    async fn list_keys(&self) -> BackendResult<Vec<String>> {
        Err(simulated())
    }

    async fn map_keys(&self, _prefix: &str) -> BackendResult<BTreeMap<String, Bytes>> {
        Err(simulated())
    }

    fn name(&self) -> &str {
        "BROKEN"
    }

    async fn reset(&self) -> BackendResult<()> {
        Err(simulated())
    }
}
