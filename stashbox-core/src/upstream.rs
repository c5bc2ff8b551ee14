use std::future::Future;

/// The origin a cache sits in front of.
///
/// Framework adapters implement this for their service type, the cache
/// pipeline only ever sees requests and responses with fully buffered bodies.
///
/// ```rust,ignore
/// use stashbox_core::Upstream;
/// use std::future::Ready;
///
/// struct Fixed(http::Response<bytes::Bytes>);
///
/// impl Upstream<http::Request<bytes::Bytes>> for Fixed {
///     type Response = Result<http::Response<bytes::Bytes>, std::io::Error>;
///     type Future = Ready<Self::Response>;
///
///     fn call(&mut self, _req: http::Request<bytes::Bytes>) -> Self::Future {
///         std::future::ready(Ok(self.0.clone()))
///     }
/// }
/// ```
pub trait Upstream<Req> {
    /// What the origin resolves to, usually a `Result`.
    type Response;

    /// Future of one origin round-trip.
    type Future: Future<Output = Self::Response> + Send;

    /// Forwards `req` to the origin.
    fn call(&mut self, req: Req) -> Self::Future;
}
