//! Integration tests for the file-proxy HTTP surface (spec §4.7), driven end to end over real
//! TCP connections: a fake object-store HTTP server stands in for the out-of-scope S3 backend
//! (spec §1), [`syncvol::proxy::backend::ObjectBackend`] is faked against it, and
//! [`syncvol::proxy::server::ProxyServer`] is driven with an actual `hyper::Client`, the same way
//! `wofferl-proxmox-backup` has no precedent for (it never serves a file tree), so this is
//! grounded directly on `proxy::server`'s own `make_service_fn`/`service_fn` server shape.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode};

use syncvol::proxy::backend::{ListResult, ObjectBackend, ObjectInfo, PresignedPut};
use syncvol::proxy::fs::VolumeProxyFs;
use syncvol::proxy::server::ProxyServer;

type Store = Arc<StdMutex<HashMap<String, Vec<u8>>>>;

/// Stands in for the object store: GET honors `Range`, PUT overwrites the key.
async fn spawn_object_store(store: Store) -> SocketAddr {
    let make_svc = make_service_fn(move |_conn| {
        let store = store.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_object_store(store.clone(), req))) }
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    addr
}

async fn handle_object_store(store: Store, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let key = req.uri().path().trim_start_matches('/').to_string();
    match req.method().as_str() {
        "GET" => {
            let data = store.lock().unwrap().get(&key).cloned();
            let Some(data) = data else {
                return Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()).unwrap());
            };
            let body = match req.headers().get("range").and_then(|v| v.to_str().ok()) {
                Some(range) => slice_range(&data, range),
                None => data,
            };
            Ok(Response::new(Body::from(body)))
        }
        "PUT" => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            store.lock().unwrap().insert(key, body.to_vec());
            Ok(Response::new(Body::empty()))
        }
        _ => Ok(Response::builder().status(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).unwrap()),
    }
}

fn slice_range(data: &[u8], range: &str) -> Vec<u8> {
    let spec = range.trim_start_matches("bytes=");
    let (start, end) = spec.split_once('-').expect("range header always has a dash");
    let start: usize = start.parse().unwrap_or(0);
    let end: usize = end.parse().unwrap_or(data.len().saturating_sub(1));
    let end = end.min(data.len().saturating_sub(1));
    if start > end {
        Vec::new()
    } else {
        data[start..=end].to_vec()
    }
}

/// Fake [`ObjectBackend`]: listing and sizes are derived straight from `store`, so an upload
/// through the proxy is immediately visible to the next `list()` call, the same way a real
/// object store's listing reflects a completed PUT.
struct FakeBackend {
    store: Store,
    store_addr: SocketAddr,
}

impl FakeBackend {
    fn new(store: Store, store_addr: SocketAddr) -> Self {
        Self { store, store_addr }
    }
}

impl ObjectBackend for FakeBackend {
    fn list<'a>(&'a self, prefix_with_slash: &'a str) -> BoxFuture<'a, Result<ListResult, syncvol::error::Error>> {
        Box::pin(async move {
            let prefix = prefix_with_slash.trim_start_matches('/');
            let store = self.store.lock().unwrap();
            let objects = store
                .iter()
                .filter(|(key, _)| key.starts_with(prefix) && !key[prefix.len()..].contains('/'))
                .map(|(key, data)| ObjectInfo {
                    key: key.clone(),
                    size: data.len() as u64,
                    last_modified: None,
                    etag: format!("\"{}\"", data.len()),
                    presigned_get_url: format!("http://{}/{}", self.store_addr, key),
                    presigned_get_expires_at: Utc::now() + Duration::hours(1),
                })
                .collect();
            Ok(ListResult {
                objects,
                common_prefixes: Vec::new(),
            })
        })
    }

    fn presign_put<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<PresignedPut, syncvol::error::Error>> {
        Box::pin(async move {
            Ok(PresignedPut {
                url: format!("http://{}/{}", self.store_addr, key),
                expires_at: Utc::now() + Duration::hours(1),
            })
        })
    }

    fn rename<'a>(&'a self, old_key: &'a str, new_key: &'a str) -> BoxFuture<'a, Result<(), syncvol::error::Error>> {
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            if let Some(data) = store.remove(old_key) {
                store.insert(new_key.to_string(), data);
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), syncvol::error::Error>> {
        Box::pin(async move {
            self.store.lock().unwrap().remove(key);
            Ok(())
        })
    }
}

#[tokio::test]
async fn reads_existing_object_via_webdav_get() {
    let store: Store = Arc::new(StdMutex::new(HashMap::new()));
    store
        .lock()
        .unwrap()
        .insert("hello.txt".to_string(), b"hello world, this is a test file for syncvol's file proxy".to_vec());
    let store_addr = spawn_object_store(store.clone()).await;

    let backend: Arc<dyn ObjectBackend> = Arc::new(FakeBackend::new(store.clone(), store_addr));
    let fs = VolumeProxyFs::new("test-repo".to_string(), backend);
    let proxy = ProxyServer::start("127.0.0.1:0".parse().unwrap(), fs).await.unwrap();
    let proxy_addr = proxy.local_addr();

    let client = Client::new();
    let response = client.get(format!("http://{}/hello.txt", proxy_addr).parse().unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"hello world, this is a test file for syncvol's file proxy".as_slice());

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn missing_key_returns_404() {
    let store: Store = Arc::new(StdMutex::new(HashMap::new()));
    let store_addr = spawn_object_store(store.clone()).await;

    let backend: Arc<dyn ObjectBackend> = Arc::new(FakeBackend::new(store.clone(), store_addr));
    let fs = VolumeProxyFs::new("test-repo".to_string(), backend);
    let proxy = ProxyServer::start("127.0.0.1:0".parse().unwrap(), fs).await.unwrap();
    let proxy_addr = proxy.local_addr();

    let client = Client::new();
    let response = client.get(format!("http://{}/nope.txt", proxy_addr).parse().unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn writes_new_object_via_webdav_put() {
    let store: Store = Arc::new(StdMutex::new(HashMap::new()));
    let store_addr = spawn_object_store(store.clone()).await;

    let backend: Arc<dyn ObjectBackend> = Arc::new(FakeBackend::new(store.clone(), store_addr));
    let fs = VolumeProxyFs::new("test-repo".to_string(), backend);
    let proxy = ProxyServer::start("127.0.0.1:0".parse().unwrap(), fs).await.unwrap();
    let proxy_addr = proxy.local_addr();

    let client = Client::new();
    let body = b"new upload content".to_vec();
    let request = Request::builder()
        .method("PUT")
        .uri(format!("http://{}/upload.txt", proxy_addr))
        .body(Body::from(body.clone()))
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert!(response.status().is_success());

    proxy.stop().await.unwrap();

    let stored = store.lock().unwrap();
    assert_eq!(stored.get("upload.txt").map(|v| v.as_slice()), Some(body.as_slice()));
}
