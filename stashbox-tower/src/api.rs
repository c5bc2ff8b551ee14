//! Standalone Tower service for the management API.
//!
//! [`CacheService`](crate::service::CacheService) already answers management
//! paths in front of the origin. [`ManagementService`] serves the same routes
//! on their own, for mounting on an internal listener.

use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Body as HttpBody;
use stashbox::{BoxError, CachePipeline, ManagementApi};
use tower::Service;

use crate::future::CacheServiceFuture;

#[derive(Clone, Debug)]
pub struct ManagementService {
    api: ManagementApi,
}

impl ManagementService {
    pub fn new(pipeline: CachePipeline) -> Self {
        Self {
            api: ManagementApi::new(pipeline),
        }
    }
}

impl<ReqBody> Service<Request<ReqBody>> for ManagementService
where
    ReqBody: HttpBody + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = CacheServiceFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let api = self.api.clone();
        CacheServiceFuture::new(async move {
            if !api.matches(req.uri().path()) {
                return Ok(not_found());
            }
            let (parts, body) = req.into_parts();
            let body = body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();
            Ok(api.handle(Request::from_parts(parts, body)).await)
        })
    }
}

fn not_found() -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
