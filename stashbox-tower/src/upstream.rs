//! Upstream adapter bridging Tower services to the cache pipeline.
//!
//! [`TowerUpstream`] implements [`Upstream`] for any Tower service taking a
//! `Request<Full<Bytes>>`. The pipeline only deals in buffered messages, so the
//! adapter reads the whole response body before handing the response back.
//!
//! Users rarely touch this module: [`CacheService`](crate::service::CacheService)
//! builds one adapter per request.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::ready;
use http::{Request, Response};
use http_body_util::combinators::Collect;
use http_body_util::{BodyExt, Full};
use hyper::body::Body as HttpBody;
use pin_project::pin_project;
use stashbox::{BoxError, UpstreamError};
use stashbox_core::Upstream;
use tower::Service;
use tower::util::{Oneshot, ServiceExt};

#[pin_project(project = StageProj)]
enum Stage<F, B>
where
    B: HttpBody,
{
    Calling {
        #[pin]
        future: F,
    },
    Collecting {
        #[pin]
        collect: Collect<B>,
        head: Response<()>,
    },
}

/// Future returned by [`TowerUpstream::call`].
///
/// Drives the service call, then collects the response body into [`Bytes`].
/// A failed call becomes [`UpstreamError::Request`], a body that breaks
/// mid-stream becomes [`UpstreamError::Body`].
#[pin_project]
pub struct TowerUpstreamFuture<F, B>
where
    B: HttpBody,
{
    #[pin]
    stage: Stage<F, B>,
}

impl<F, B> TowerUpstreamFuture<F, B>
where
    B: HttpBody,
{
    /// Creates a future driving the service's response future.
    pub fn new(future: F) -> Self {
        Self {
            stage: Stage::Calling { future },
        }
    }
}

impl<F, B, E> Future for TowerUpstreamFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    E: Into<BoxError>,
    B: HttpBody,
    B::Error: Into<BoxError>,
{
    type Output = Result<Response<Bytes>, UpstreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.stage.as_mut().project() {
                StageProj::Calling { future } => {
                    let response = ready!(future.poll(cx)).map_err(UpstreamError::request)?;
                    let (parts, body) = response.into_parts();
                    this.stage.set(Stage::Collecting {
                        collect: body.collect(),
                        head: Response::from_parts(parts, ()),
                    });
                }
                StageProj::Collecting { collect, head } => {
                    let collected = ready!(collect.poll(cx)).map_err(UpstreamError::body)?;
                    let body = collected.to_bytes();
                    return Poll::Ready(Ok(std::mem::take(head).map(|()| body)));
                }
            }
        }
    }
}

/// Adapter implementing [`Upstream`] for a Tower service.
///
/// Every call clones the wrapped service and drives the clone through
/// [`ServiceExt::oneshot`], so readiness is awaited before the request is sent.
#[derive(Clone, Debug)]
pub struct TowerUpstream<S> {
    service: S,
}

impl<S> TowerUpstream<S> {
    /// Creates a new upstream adapter wrapping the given service.
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S, ResBody> Upstream<Request<Bytes>> for TowerUpstream<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    ResBody: HttpBody + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    type Response = Result<Response<Bytes>, UpstreamError>;
    type Future = TowerUpstreamFuture<Oneshot<S, Request<Full<Bytes>>>, ResBody>;

    fn call(&mut self, req: Request<Bytes>) -> Self::Future {
        TowerUpstreamFuture::new(self.service.clone().oneshot(req.map(Full::new)))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http::StatusCode;
    use tower::service_fn;

    use super::*;

    #[tokio::test]
    async fn buffers_the_response_body() {
        let service = service_fn(|request: Request<Full<Bytes>>| async move {
            let body = request.into_body().collect().await?.to_bytes();
            Ok::<_, Infallible>(
                Response::builder()
                    .status(StatusCode::CREATED)
                    .header("x-echo", "1")
                    .body(Full::new(body))
                    .unwrap(),
            )
        });
        let mut upstream = TowerUpstream::new(service);

        let response = upstream
            .call(Request::new(Bytes::from_static(b"ping")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-echo"], "1");
        assert_eq!(response.body(), &Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn service_errors_are_request_failures() {
        let service = service_fn(|_: Request<Full<Bytes>>| async {
            Err::<Response<Full<Bytes>>, _>(std::io::Error::other("refused"))
        });
        let mut upstream = TowerUpstream::new(service);

        let error = upstream.call(Request::new(Bytes::new())).await.unwrap_err();
        assert!(matches!(error, UpstreamError::Request(_)));
    }
}
