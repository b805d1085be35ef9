#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::net::TcpListener;

use httpvfs::Config;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub range: Option<String>,
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(http::Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let log = Arc::clone(&log);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                log.lock().expect("request log").push(RecordedRequest {
                                    method: req.method().clone(),
                                    path: req.uri().path().to_string(),
                                    range: req
                                        .headers()
                                        .get("Range")
                                        .and_then(|v| v.to_str().ok())
                                        .map(str::to_string),
                                });
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
            requests,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `/vsicurl/http://<addr><path>`
    pub fn vsi_path(&self, path: &str) -> String {
        format!("/vsicurl/http://{}{}", self.addr, path)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("request log").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("request log").len()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests
            .lock()
            .expect("request log")
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Short retry delays so error-path tests stay fast.
pub fn test_config() -> Config {
    Config {
        retry_delay: Duration::from_millis(10),
        ..Config::default()
    }
}

pub fn gen_payload(size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    builder.body(Full::new(body)).unwrap()
}

/// Serve a fixed payload with HEAD and byte-range support, the way a
/// well-behaved static file server would.
pub fn serve_file(
    payload: Bytes,
) -> impl Fn(http::Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static {
    move |req: http::Request<Incoming>| {
        let len = payload.len() as u64;
        let mut headers = HeaderMap::new();
        headers.insert("ETag", "\"d41d8cd98f\"".parse().unwrap());
        headers.insert(
            "Last-Modified",
            "Mon, 01 Jan 2024 00:00:00 GMT".parse().unwrap(),
        );
        match *req.method() {
            Method::HEAD => {
                headers.insert("Content-Length", len.to_string().parse().unwrap());
                build_response(StatusCode::OK, headers, Bytes::new())
            }
            Method::GET => {
                let range = req
                    .headers()
                    .get("Range")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_range_header);
                match range {
                    Some((start, _)) if start >= len => {
                        headers.insert(
                            "Content-Range",
                            format!("bytes */{}", len).parse().unwrap(),
                        );
                        build_response(StatusCode::RANGE_NOT_SATISFIABLE, headers, Bytes::new())
                    }
                    Some((start, end)) => {
                        let end = end.min(len - 1);
                        let slice = payload.slice(start as usize..=end as usize);
                        headers.insert(
                            "Content-Range",
                            format!("bytes {}-{}/{}", start, end, len).parse().unwrap(),
                        );
                        headers.insert(
                            "Content-Length",
                            slice.len().to_string().parse().unwrap(),
                        );
                        build_response(StatusCode::PARTIAL_CONTENT, headers, slice)
                    }
                    None => {
                        headers.insert("Content-Length", len.to_string().parse().unwrap());
                        build_response(StatusCode::OK, headers, payload.clone())
                    }
                }
            }
            _ => build_response(StatusCode::METHOD_NOT_ALLOWED, headers, Bytes::new()),
        }
    }
}

/// `bytes=a-b` (both bounds required, which is all the crate sends).
pub fn parse_range_header(header: &str) -> Option<(u64, u64)> {
    let rest = header.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}
