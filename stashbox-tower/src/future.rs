use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Future, ready};
use http::Response;
use http_body_util::Full;
use pin_project::pin_project;
use stashbox::BoxError;
use tracing::debug;

/// Future returned by [`CacheService`](crate::service::CacheService).
///
/// Wraps the pipeline run and turns the buffered response back into a body
/// the surrounding stack can stream.
#[pin_project]
pub struct CacheServiceFuture {
    #[pin]
    inner: BoxFuture<'static, Result<Response<Bytes>, BoxError>>,
}

impl CacheServiceFuture {
    pub fn new<F>(inner: F) -> Self
    where
        F: Future<Output = Result<Response<Bytes>, BoxError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Future for CacheServiceFuture {
    type Output = Result<Response<Full<Bytes>>, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        if let Err(error) = &result {
            debug!(error = %error, "cache service failed");
        }
        Poll::Ready(result.map(|response| response.map(Full::new)))
    }
}

impl std::fmt::Debug for CacheServiceFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheServiceFuture").finish_non_exhaustive()
    }
}
