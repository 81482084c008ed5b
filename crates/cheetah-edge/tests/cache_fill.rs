use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cheetah_edge::layout::cache_path;
use cheetah_edge::{
    CacheHandler, EdgeRequest, OriginController, OriginHandle, ProxyHandler, RequestValidator,
    ServeHandler, UpstreamTuning,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;

const CHAPTER: &str = "0123456789abcdefABCDEF0123456789";
const HASH: &str = "f00dfeedf00dfeedf00dfeedf00dfeedf00dfeedf00dfeedf00dfeedf00dfeed";
const IMAGE: &[u8] = b"\x89PNG fake image body";

fn image_path(hash: &str) -> String {
    format!("/token/data/{CHAPTER}/x1-{hash}.png")
}

/// Minimal origin: answers 404 for paths containing `dead`, otherwise the image.
async fn spawn_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let missing = request.uri().path().contains("dead");
                    async move {
                        let response = if missing {
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Full::new(Bytes::from_static(b"gone")))
                        } else {
                            Response::builder()
                                .header("content-type", "image/png")
                                .header("x-origin", "test")
                                .body(Full::new(Bytes::from_static(IMAGE)))
                        };
                        Ok::<_, Infallible>(response.expect("response"))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

fn cache_handler(root: &Path, origin: &str) -> CacheHandler {
    following(root, OriginHandle::fixed(origin))
}

fn following(root: &Path, origin: OriginHandle) -> CacheHandler {
    CacheHandler::new(
        root,
        origin,
        Arc::new(RequestValidator::disabled()),
        &UpstreamTuning::default(),
    )
    .expect("cache handler")
}

#[tokio::test]
async fn miss_fetches_once_then_serves_from_disk() {
    let (addr, hits) = spawn_origin().await;
    let root = tempfile::tempdir().expect("tempdir");
    let handler = cache_handler(root.path(), &format!("http://{addr}"));
    let request = || EdgeRequest::new(Method::GET, &image_path(HASH));

    let miss = handler.handle(request()).await.expect("miss");
    assert_eq!(miss.status(), StatusCode::OK);
    assert_eq!(miss.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(miss.headers().get("x-origin").unwrap(), "test");
    assert_eq!(&miss.into_bytes().await.expect("body")[..], IMAGE);

    let stored = cache_path(root.path(), &format!("{HASH}.png"));
    assert_eq!(std::fs::read(&stored).expect("stored once the body ended"), IMAGE);

    let hit = handler.handle(request()).await.expect("hit");
    assert_eq!(hit.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(
        hit.headers().get("cache-control").unwrap(),
        "public, max-age=1209600"
    );
    assert_eq!(hit.headers().get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(hit.headers().get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(&hit.into_bytes().await.expect("body")[..], IMAGE);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_errors_are_relayed_but_not_cached() {
    let (addr, hits) = spawn_origin().await;
    let root = tempfile::tempdir().expect("tempdir");
    let handler = cache_handler(root.path(), &format!("http://{addr}"));
    let dead = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    let response = handler
        .handle(EdgeRequest::new(Method::GET, &image_path(dead)))
        .await
        .expect("relayed");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");
    let _ = response.into_bytes().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!cache_path(root.path(), &format!("{dead}.png")).exists());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_path_never_reaches_upstream() {
    let (addr, hits) = spawn_origin().await;
    let root = tempfile::tempdir().expect("tempdir");
    let handler = cache_handler(root.path(), &format!("http://{addr}"));

    let err = handler
        .handle(EdgeRequest::new(Method::GET, "/token/data/short/x-abc.png"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let root = tempfile::tempdir().expect("tempdir");
    let handler = cache_handler(root.path(), &format!("http://{addr}"));
    let err = handler
        .handle(EdgeRequest::new(Method::GET, &image_path(HASH)))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn proxy_streams_from_first_origin() {
    let (addr, hits) = spawn_origin().await;
    let handler = ProxyHandler::new(
        &[format!("http://{addr}"), "http://127.0.0.1:9".to_string()],
        Arc::new(RequestValidator::disabled()),
        &UpstreamTuning::default(),
    )
    .expect("proxy handler");

    let response = handler
        .handle(EdgeRequest::new(Method::GET, &image_path(HASH)))
        .await
        .expect("proxied");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-cache").is_none());
    assert_eq!(&response.into_bytes().await.expect("body")[..], IMAGE);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn head_returns_headers_without_body_or_cache_entry() {
    let (addr, hits) = spawn_origin().await;
    let root = tempfile::tempdir().expect("tempdir");
    let handler = cache_handler(root.path(), &format!("http://{addr}"));
    let stored = cache_path(root.path(), &format!("{HASH}.png"));

    let miss = handler
        .handle(EdgeRequest::new(Method::HEAD, &image_path(HASH)))
        .await
        .expect("head miss");
    assert_eq!(miss.status(), StatusCode::OK);
    assert_eq!(miss.headers().get("x-cache").unwrap(), "MISS");
    assert!(miss.into_bytes().await.expect("body").is_empty());
    assert!(!stored.exists());

    let _ = handler
        .handle(EdgeRequest::new(Method::GET, &image_path(HASH)))
        .await
        .expect("get miss")
        .into_bytes()
        .await
        .expect("body");
    let hit = handler
        .handle(EdgeRequest::new(Method::HEAD, &image_path(HASH)))
        .await
        .expect("head hit");
    assert_eq!(hit.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(
        hit.headers().get("content-length").unwrap(),
        IMAGE.len().to_string().as_str()
    );
    assert!(hit.into_bytes().await.expect("body").is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn misses_follow_origin_updates() {
    let (first, first_hits) = spawn_origin().await;
    let (second, second_hits) = spawn_origin().await;
    let root = tempfile::tempdir().expect("tempdir");
    let (controller, origin) = OriginController::new(format!("http://{first}"));
    let handler = following(root.path(), origin);

    let before = handler
        .handle(EdgeRequest::new(Method::GET, &image_path(HASH)))
        .await
        .expect("first origin");
    assert_eq!(&before.into_bytes().await.expect("body")[..], IMAGE);

    assert!(controller.update(&format!("http://{second}")));
    let other = "0000111122223333444455556666777788889999aaaabbbbccccddddeeeeffff";
    let after = handler
        .handle(EdgeRequest::new(Method::GET, &image_path(other)))
        .await
        .expect("second origin");
    assert_eq!(&after.into_bytes().await.expect("body")[..], IMAGE);

    assert_eq!(first_hits.load(Ordering::SeqCst), 1);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
}
