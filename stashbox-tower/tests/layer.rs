use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use pretty_assertions::assert_eq;
use stashbox::CacheConfig;
use stashbox::cache_status::CACHE_STATUS;
use stashbox_moka::MokaStorage;
use stashbox_tower::{Cache, ManagementService};
use tower::{Layer, Service, ServiceExt, service_fn};

fn cache() -> Cache {
    Cache::builder()
        .config(CacheConfig::default())
        .storage(MokaStorage::builder().max_entries(100).name("MEMORY").build())
        .build()
        .unwrap()
}

fn get(path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(path)
        .header(http::header::HOST, "example.com")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn status(response: &Response<Full<Bytes>>) -> String {
    response.headers()[CACHE_STATUS].to_str().unwrap().to_owned()
}

async fn body(response: Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

/// Origin answering `hello` with a one minute lifetime, counting calls.
fn counting_origin(
    calls: Arc<AtomicUsize>,
) -> impl tower::Service<
    Request<Full<Bytes>>,
    Response = Response<Full<Bytes>>,
    Error = Infallible,
    Future = impl Send,
> + Clone
+ Send
+ 'static {
    service_fn(move |_req: Request<Full<Bytes>>| {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            Ok::<_, Infallible>(
                Response::builder()
                    .header("cache-control", "max-age=60")
                    .body(Full::new(Bytes::from_static(b"hello")))
                    .unwrap(),
            )
        }
    })
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut service = cache().layer(counting_origin(calls.clone()));

    let first = ServiceExt::<Request<Full<Bytes>>>::ready(&mut service).await.unwrap().call(get("/a")).await.unwrap();
    assert_eq!(
        status(&first),
        "Stashbox; fwd=uri-miss; fwd-status=200; key=GET-example.com-/a; stored"
    );
    assert_eq!(body(first).await, Bytes::from_static(b"hello"));

    let second = ServiceExt::<Request<Full<Bytes>>>::ready(&mut service).await.unwrap().call(get("/a")).await.unwrap();
    assert!(status(&second).starts_with("Stashbox; hit; ttl="));
    assert_eq!(body(second).await, Bytes::from_static(b"hello"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_body_reaches_the_origin() {
    let echo = service_fn(|request: Request<Full<Bytes>>| async move {
        let body = request.into_body().collect().await?.to_bytes();
        Ok::<_, Infallible>(Response::new(Full::new(body)))
    });
    let service = cache().layer(echo);

    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .header(http::header::HOST, "example.com")
        .body(Full::new(Bytes::from_static(b"payload")))
        .unwrap();
    let response = service.oneshot(request).await.unwrap();
    assert_eq!(body(response).await, Bytes::from_static(b"payload"));
}

#[tokio::test]
async fn origin_errors_surface_as_service_errors() {
    let failing = service_fn(|_: Request<Full<Bytes>>| async {
        Err::<Response<Full<Bytes>>, _>(std::io::Error::other("connection refused"))
    });
    let service = cache().layer(failing);

    let error = service.oneshot(get("/down")).await.unwrap_err();
    assert!(error.to_string().contains("connection refused"), "{error}");
}

#[tokio::test]
async fn management_paths_never_reach_the_origin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut service = cache().layer(counting_origin(calls.clone()));
    ServiceExt::<Request<Full<Bytes>>>::ready(&mut service).await.unwrap().call(get("/a")).await.unwrap();

    let listing = ServiceExt::<Request<Full<Bytes>>>::ready(&mut service)
        .await
        .unwrap()
        .call(get("/stashbox-api/stashbox"))
        .await
        .unwrap();
    assert_eq!(listing.status(), StatusCode::OK);
    let keys: Vec<String> = serde_json::from_slice(&body(listing).await).unwrap();
    assert_eq!(keys, vec!["GET-example.com-/a"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn standalone_management_service() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    cache
        .layer(counting_origin(calls.clone()))
        .oneshot(get("/a"))
        .await
        .unwrap();

    let mut management = ManagementService::new(cache.pipeline().clone());
    let flush = Request::builder()
        .method("PURGE")
        .uri("/stashbox-api/stashbox/flush")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = ServiceExt::<Request<Full<Bytes>>>::ready(&mut management).await.unwrap().call(flush).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(cache.pipeline().storages().list_keys().await.is_empty());

    let elsewhere = ServiceExt::<Request<Full<Bytes>>>::ready(&mut management).await.unwrap().call(get("/a")).await.unwrap();
    assert_eq!(elsewhere.status(), StatusCode::NOT_FOUND);
}
