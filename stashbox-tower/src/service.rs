use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Body as HttpBody;
use stashbox::{BoxError, CacheError, CachePipeline, ManagementApi};
use tower::Service;

use crate::future::CacheServiceFuture;
use crate::upstream::TowerUpstream;

/// Tower service running every request through a [`CachePipeline`].
///
/// Requests under the management base path are answered by the
/// [`ManagementApi`] and never reach the wrapped service.
#[derive(Clone, Debug)]
pub struct CacheService<S> {
    upstream: S,
    pipeline: CachePipeline,
    api: ManagementApi,
}

impl<S> CacheService<S> {
    pub fn new(upstream: S, pipeline: CachePipeline) -> Self {
        let api = ManagementApi::new(pipeline.clone());
        CacheService {
            upstream,
            pipeline,
            api,
        }
    }

    pub fn pipeline(&self) -> &CachePipeline {
        &self.pipeline
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CacheService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    ReqBody: HttpBody + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
    ResBody: HttpBody + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = CacheServiceFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each origin call drives readiness on its own clone of the service.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let upstream = TowerUpstream::new(self.upstream.clone());
        let pipeline = self.pipeline.clone();
        let api = self.api.clone();

        CacheServiceFuture::new(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();
            let request = Request::from_parts(parts, body);

            if api.matches(request.uri().path()) {
                return Ok(api.handle(request).await);
            }
            pipeline
                .handle(request, upstream)
                .await
                .map_err(CacheError::into_upstream)
        })
    }
}
