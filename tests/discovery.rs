mod support;

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use httpvfs::{AuthProvider, HttpVfs, VfsError};
use support::*;

#[tokio::test]
async fn head_populates_size_etag_and_mtime() {
    let payload = gen_payload(12_345);
    let server = MockServer::start(serve_file(payload)).await;
    let vfs = HttpVfs::with_config(test_config());
    let mut file = vfs.open(&server.vsi_path("/data.bin")).unwrap();

    assert_eq!(file.size().await, 12_345);
    assert!(file.exists().await);

    let props = file.stat().await.unwrap();
    assert_eq!(props.size, 12_345);
    assert_eq!(props.etag, "d41d8cd98f");
    // Mon, 01 Jan 2024 00:00:00 GMT
    assert_eq!(props.mtime, 1_704_067_200);
    assert!(!props.is_directory);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::HEAD);
}

#[tokio::test]
async fn head_405_falls_back_to_get() {
    let payload = gen_payload(5000);
    let file_handler = serve_file(payload);
    let server = MockServer::start(move |req| {
        if req.method() == Method::HEAD {
            build_response(StatusCode::METHOD_NOT_ALLOWED, HeaderMap::new(), Bytes::new())
        } else {
            file_handler(req)
        }
    })
    .await;
    let vfs = HttpVfs::with_config(test_config());
    let mut file = vfs.open(&server.vsi_path("/data.bin")).unwrap();

    assert_eq!(file.size().await, 5000);
    assert!(file.stat().await.is_ok());

    let methods: Vec<Method> = server.requests().iter().map(|r| r.method.clone()).collect();
    assert_eq!(methods, vec![Method::HEAD, Method::GET]);
}

#[tokio::test]
async fn http_416_means_empty_existing_file() {
    let server = MockServer::start(|_req| {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Range", "bytes */0".parse().unwrap());
        build_response(StatusCode::RANGE_NOT_SATISFIABLE, headers, Bytes::new())
    })
    .await;
    let vfs = HttpVfs::with_config(test_config());
    let mut file = vfs.open(&server.vsi_path("/empty.bin")).unwrap();

    assert!(file.exists().await);
    assert_eq!(file.size().await, 0);
}

#[tokio::test]
async fn missing_object_is_negative_and_silent() {
    let server = MockServer::start(|_req| {
        build_response(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new())
    })
    .await;
    let vfs = HttpVfs::with_config(test_config());

    let mut file = vfs.open(&server.vsi_path("/gone.bin")).unwrap();
    assert!(!file.exists().await);
    assert_eq!(file.size().await, 0);
    assert_eq!(file.stat().await.unwrap_err(), VfsError::Http(404));

    // the negative result is cached for the next handle
    let before = server.request_count();
    let mut again = vfs.open(&server.vsi_path("/gone.bin")).unwrap();
    assert!(!again.exists().await);
    assert_eq!(server.request_count(), before);
}

#[tokio::test]
async fn directory_inferred_from_trailing_slash_redirect() {
    let server = MockServer::start(|req| {
        if req.uri().path() == "/dir" {
            let mut headers = HeaderMap::new();
            headers.insert("Location", "/dir/".parse().unwrap());
            build_response(StatusCode::MOVED_PERMANENTLY, headers, Bytes::new())
        } else {
            let mut headers = HeaderMap::new();
            headers.insert("Content-Length", "0".parse().unwrap());
            build_response(StatusCode::OK, headers, Bytes::new())
        }
    })
    .await;
    let vfs = HttpVfs::with_config(test_config());

    let mut file = vfs.open(&server.vsi_path("/dir")).unwrap();
    let props = file.stat().await.unwrap();
    assert!(props.is_directory);
    assert_eq!(props.size, 0);
}

#[tokio::test]
async fn url_ending_in_slash_is_a_directory() {
    let server = MockServer::start(|_req| {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Length", "0".parse().unwrap());
        build_response(StatusCode::OK, headers, Bytes::new())
    })
    .await;
    let vfs = HttpVfs::with_config(test_config());

    let mut file = vfs.open(&server.vsi_path("/listing/")).unwrap();
    let props = file.stat().await.unwrap();
    assert!(props.is_directory);
}

#[tokio::test]
async fn server_ignoring_ranges_is_detected() {
    let payload = gen_payload(1_000_000);
    let server = MockServer::start(move |_req| {
        // a server that ignores Range and always sends the whole object
        let mut headers = HeaderMap::new();
        headers.insert(
            "Content-Length",
            payload.len().to_string().parse().unwrap(),
        );
        build_response(StatusCode::OK, headers, payload.clone())
    })
    .await;
    let vfs = HttpVfs::with_config(test_config());
    let mut file = vfs.open(&server.vsi_path("/nr.bin")).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(file.read(&mut buf).await, 0);
    assert!(!file.exists().await);
    assert_eq!(file.stat().await.unwrap_err(), VfsError::RangeNotSupported);
}

struct PublicKeyBackend {
    url: String,
}

impl AuthProvider for PublicKeyBackend {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn use_limit_range_get(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn limit_range_get_discovers_size_and_seeds_cache() {
    let payload = gen_payload(100_000);
    let server = MockServer::start(serve_file(payload.clone())).await;
    let vfs = HttpVfs::with_config(test_config());
    let provider = Arc::new(PublicKeyBackend {
        url: server.url("/pub.bin"),
    });
    let mut file = vfs
        .open_with_auth(&server.vsi_path("/pub.bin"), provider)
        .unwrap();

    assert_eq!(file.size().await, 100_000);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::GET);
    assert_eq!(requests[0].range.as_deref(), Some("bytes=0-16383"));

    // the ingested bytes ended up in the region cache
    file.seek(SeekFrom::Start(0)).await;
    let mut buf = vec![0u8; 100];
    assert_eq!(file.read(&mut buf).await, 100);
    assert_eq!(&buf[..], &payload[..100]);
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn head_hostile_host_pattern_goes_straight_to_get() {
    let payload = gen_payload(3000);
    let server = MockServer::start(serve_file(payload)).await;
    let vfs = HttpVfs::with_config(test_config());
    let mut file = vfs
        .open(&server.vsi_path("/a.tiles.mapbox.com/1/2/3.png"))
        .unwrap();

    assert_eq!(file.size().await, 3000);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::GET);
}

#[tokio::test]
async fn use_head_knob_disables_head_probe() {
    let payload = gen_payload(3000);
    let server = MockServer::start(serve_file(payload)).await;
    let vfs = HttpVfs::with_config(test_config());
    let path = format!(
        "/vsicurl?use_head=no&url=http%3A%2F%2F{}%2Fdata.bin",
        server.addr()
    );
    let mut file = vfs.open(&path).unwrap();

    assert_eq!(file.size().await, 3000);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::GET);
}
