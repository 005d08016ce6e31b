//! Integration tests for the record, replay and record-once cycle

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tapedeck::config::{Config, Mode};
use tapedeck::network::Server;
use tapedeck::proxy::HttpProxy;
use tapedeck::storage::{Meta, RecordingStore, META_FILE};

/// Stub upstream answering every request with a numbered joke
async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let counter = Arc::clone(&counter);
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, Infallible>(joke(request.uri().to_string(), n))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, calls)
}

fn joke(uri: String, n: usize) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "id": n,
        "url": uri,
        "value": "Chuck Norris can unit test an entire application with a single assert.",
    });
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    let headers = response.headers_mut();
    headers.insert("content-type", "application/json".parse().unwrap());
    headers.insert("retry-after", "30".parse().unwrap());
    headers.insert("x-upstream-call", n.to_string().parse().unwrap());
    response
}

struct RunningProxy {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<tapedeck::Result<()>>,
}

impl RunningProxy {
    async fn start(config: &Config) -> Self {
        let proxy = Arc::new(HttpProxy::from_config(config).unwrap());
        let server = Server::bind(config.listen, proxy, 64).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.run());
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    /// Stop serving and wait until pending recordings are finalized
    async fn stop(self) {
        self.shutdown.send(()).ok();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn config(mode: Mode, store: &Path, upstream: Option<SocketAddr>) -> Config {
    let mut config = Config::new(mode, store);
    config.listen = ([127, 0, 0, 1], 0).into();
    config.upstream = upstream.map(|addr| format!("http://{addr}"));
    config
}

struct Fetched {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

async fn get(proxy: SocketAddr, path: &str) -> Fetched {
    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let uri = format!("http://{proxy}{path}").parse().unwrap();
    let response = client.get(uri).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Fetched {
        status,
        headers,
        body,
    }
}

async fn only_meta(store: &Path) -> Meta {
    let entries = RecordingStore::new(store).list().await.unwrap();
    assert_eq!(entries.len(), 1, "expected exactly one recording");
    assert!(entries[0].complete);
    let bytes = tokio::fs::read(entries[0].dir.join(META_FILE)).await.unwrap();
    Meta::from_json(&bytes).unwrap()
}

#[tokio::test]
async fn test_record_once_then_replay_round_trip() {
    let store = TempDir::new().unwrap();
    let (upstream, calls) = spawn_upstream().await;

    let mut record_config = config(Mode::RecordOnce, store.path(), Some(upstream));
    record_config.strip_headers = vec!["content-length".to_string(), "retry-after".to_string()];
    let proxy = RunningProxy::start(&record_config).await;

    let first = get(proxy.addr, "/jokes/random").await;
    assert_eq!(first.status, StatusCode::OK);
    assert!(first.headers.get("retry-after").is_none());
    assert_eq!(first.headers["content-type"], "application/json");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = get(proxy.addr, "/jokes/random").await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body, first.body);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second request must be replayed");
    proxy.stop().await;

    let meta = only_meta(store.path()).await;
    assert_eq!(meta.status, 200);
    assert!(!meta.headers.contains_key("date"));
    assert!(!meta.headers.contains_key("content-length"));
    assert!(!meta.headers.contains_key("retry-after"));
    assert_eq!(meta.headers["x-upstream-call"], "1");

    // A replay-only proxy needs no upstream at all
    let replay = RunningProxy::start(&config(Mode::Replay, store.path(), None)).await;
    let replayed = get(replay.addr, "/jokes/random").await;
    assert_eq!(replayed.status, StatusCode::OK);
    assert_eq!(replayed.body, first.body);
    assert_eq!(replayed.headers["x-upstream-call"], "1");
    replay.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_known_length_response_is_recorded() {
    let store = TempDir::new().unwrap();
    let (upstream, calls) = spawn_upstream().await;

    // Default pipeline keeps the upstream content-length
    let proxy = RunningProxy::start(&config(Mode::RecordOnce, store.path(), Some(upstream))).await;
    let first = get(proxy.addr, "/jokes/random").await;
    let length = first.body.len().to_string();
    assert_eq!(first.headers["content-length"], length.as_str());

    let second = get(proxy.addr, "/jokes/random").await;
    assert_eq!(second.body, first.body);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    proxy.stop().await;

    let meta = only_meta(store.path()).await;
    assert_eq!(meta.headers["content-length"], length);
    assert_eq!(meta.headers["retry-after"], "30");
}

#[tokio::test]
async fn test_replay_before_record_is_failed_dependency() {
    let store = TempDir::new().unwrap();
    let proxy = RunningProxy::start(&config(Mode::Replay, store.path(), None)).await;

    let response = get(proxy.addr, "/jokes/random").await;
    assert_eq!(response.status, StatusCode::FAILED_DEPENDENCY);
    assert_eq!(&response.body[..], b"No recording for /jokes/random");
    proxy.stop().await;
}

#[tokio::test]
async fn test_incomplete_recording_is_failed_dependency() {
    let store = TempDir::new().unwrap();
    let (upstream, _calls) = spawn_upstream().await;

    let proxy = RunningProxy::start(&config(Mode::Record, store.path(), Some(upstream))).await;
    assert_eq!(get(proxy.addr, "/jokes/random").await.status, StatusCode::OK);
    proxy.stop().await;

    let entries = RecordingStore::new(store.path()).list().await.unwrap();
    tokio::fs::remove_file(entries[0].dir.join(META_FILE))
        .await
        .unwrap();

    let replay = RunningProxy::start(&config(Mode::Replay, store.path(), None)).await;
    let response = get(replay.addr, "/jokes/random").await;
    assert_eq!(response.status, StatusCode::FAILED_DEPENDENCY);
    assert!(String::from_utf8_lossy(&response.body).starts_with("No meta.json in "));
    replay.stop().await;
}

#[tokio::test]
async fn test_concurrent_first_requests_share_one_recording() {
    let store = TempDir::new().unwrap();
    let (upstream, calls) = spawn_upstream().await;
    let proxy = RunningProxy::start(&config(Mode::RecordOnce, store.path(), Some(upstream))).await;

    let addr = proxy.addr;
    let requests: Vec<_> = (0..8)
        .map(|_| tokio::spawn(async move { get(addr, "/jokes/random").await }))
        .collect();
    let mut bodies = Vec::new();
    for request in requests {
        let fetched = request.await.unwrap();
        assert_eq!(fetched.status, StatusCode::OK);
        bodies.push(fetched.body);
    }
    proxy.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(only_meta(store.path()).await.headers["x-upstream-call"], "1");
}

#[tokio::test]
async fn test_record_mode_overwrites() {
    let store = TempDir::new().unwrap();
    let (upstream, calls) = spawn_upstream().await;

    let proxy = RunningProxy::start(&config(Mode::Record, store.path(), Some(upstream))).await;
    get(proxy.addr, "/jokes/random").await;
    let latest = get(proxy.addr, "/jokes/random").await;
    proxy.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(only_meta(store.path()).await.headers["x-upstream-call"], "2");

    let replay = RunningProxy::start(&config(Mode::Replay, store.path(), None)).await;
    assert_eq!(get(replay.addr, "/jokes/random").await.body, latest.body);
    replay.stop().await;
}

#[tokio::test]
async fn test_query_parameters_in_key() {
    let store = TempDir::new().unwrap();
    let (upstream, calls) = spawn_upstream().await;

    let mut record_config = config(Mode::RecordOnce, store.path(), Some(upstream));
    record_config.key.query = vec!["category".to_string()];
    let proxy = RunningProxy::start(&record_config).await;

    let dev = get(proxy.addr, "/jokes/random?category=dev").await;
    let food = get(proxy.addr, "/jokes/random?category=food").await;
    let dev_again = get(proxy.addr, "/jokes/random?category=dev&page=3").await;
    proxy.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_ne!(dev.body, food.body);
    assert_eq!(dev_again.body, dev.body);

    let entries = RecordingStore::new(store.path()).list().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.path_prefix == "jokes/random"));
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let store = TempDir::new().unwrap();
    // Bind then drop to get a port nothing listens on
    let closed = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let proxy = RunningProxy::start(&config(Mode::RecordOnce, store.path(), Some(closed))).await;
    let response = get(proxy.addr, "/jokes/random").await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    proxy.stop().await;

    let entries = RecordingStore::new(store.path()).list().await.unwrap();
    assert!(entries.iter().all(|e| !e.complete));
}
