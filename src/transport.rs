use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::auth::lock;

pub(crate) type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

const MAX_REDIRECTS: usize = 10;

/// Pass-through HTTP knobs from the `/vsicurl?` query form. `proxy*` and
/// `low_speed_*` are carried for interface compatibility; the client has no
/// per-request equivalent for them.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub useragent: Option<String>,
    pub referer: Option<String>,
    pub cookie: Option<String>,
    pub header_file: Option<String>,
    pub unsafessl: bool,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub low_speed_time: Option<Duration>,
    pub low_speed_limit: Option<u64>,
    pub proxy: Option<String>,
    pub proxyauth: Option<String>,
    pub proxyuserpwd: Option<String>,
}

impl HttpOptions {
    /// Returns false for keys this layer does not recognize.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        match key {
            "useragent" => self.useragent = Some(value.to_string()),
            "referer" => self.referer = Some(value.to_string()),
            "cookie" => self.cookie = Some(value.to_string()),
            "header_file" => self.header_file = Some(value.to_string()),
            "unsafessl" => self.unsafessl = crate::url::test_bool(value),
            "timeout" => self.timeout = parse_secs(value),
            "connecttimeout" => self.connect_timeout = parse_secs(value),
            "low_speed_time" => self.low_speed_time = parse_secs(value),
            "low_speed_limit" => self.low_speed_limit = value.parse().ok(),
            "proxy" => self.proxy = Some(value.to_string()),
            "proxyauth" => self.proxyauth = Some(value.to_string()),
            "proxyuserpwd" => self.proxyuserpwd = Some(value.to_string()),
            _ => return false,
        }
        true
    }

    fn file_headers(&self) -> Vec<(String, String)> {
        let Some(path) = &self.header_file else {
            return Vec::new();
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| {
                    let (k, v) = line.split_once(':')?;
                    let k = k.trim();
                    let v = v.trim();
                    (!k.is_empty()).then(|| (k.to_string(), v.to_string()))
                })
                .collect(),
            Err(e) => {
                log::warn!("cannot read header file {}: {}", path, e);
                Vec::new()
            }
        }
    }
}

fn parse_secs(value: &str) -> Option<Duration> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| *v >= 0.0)
        .map(Duration::from_secs_f64)
}

/// One client per filesystem, built on first use and dropped on cache
/// clears, releasing every pooled connection.
pub(crate) struct ConnectionPool {
    client: std::sync::Mutex<Option<HttpClient>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            client: std::sync::Mutex::new(None),
        }
    }

    fn client(&self, options: &HttpOptions) -> Result<HttpClient, String> {
        let mut slot = lock(&self.client);
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = build_client(options)?;
        *slot = Some(client.clone());
        Ok(client)
    }

    pub fn clear(&self) {
        *lock(&self.client) = None;
    }
}

fn build_client(options: &HttpOptions) -> Result<HttpClient, String> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(options.connect_timeout);
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(options.unsafessl)
        .danger_accept_invalid_hostnames(options.unsafessl)
        .build()
        .map_err(|e| format!("TLS init: {}", e))?;
    let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
    Ok(Client::builder(TokioExecutor::new()).build(https))
}

pub(crate) struct ProbeRequest {
    pub verb: Method,
    pub url: String,
    /// Inclusive byte range.
    pub range: Option<(u64, u64)>,
    /// Stop after the response headers (but still follow redirects).
    pub header_only: bool,
    pub detect_range_error: bool,
    pub follow_redirects: bool,
    pub extra_headers: HeaderMap,
}

#[derive(Debug, Default)]
pub(crate) struct ProbeResult {
    /// 0 when no status line was obtained.
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub effective_url: String,
    pub content_length: Option<u64>,
    pub has_content_range: bool,
    /// Server `Date:` header, Unix seconds, 0 when absent.
    pub date_unix: u64,
    /// `Last-Modified:`, Unix seconds, 0 when absent.
    pub mtime_unix: u64,
    pub etag: Option<String>,
    pub azure_resource_type: Option<String>,
    pub azure_permissions: Option<String>,
    pub range_error: bool,
    pub interrupted: bool,
    pub error: Option<String>,
}

/// Drive one request: manual redirect following with effective-URL tracking,
/// full header capture, optional header-only cutoff, the range-support
/// heuristic, and body streaming through the interrupt callback.
pub(crate) async fn probe(
    pool: &ConnectionPool,
    options: &HttpOptions,
    request: ProbeRequest,
    on_body: Option<&mut (dyn FnMut(&[u8]) -> bool + Send + 'static)>,
) -> ProbeResult {
    let mut result = ProbeResult {
        effective_url: request.url.clone(),
        ..ProbeResult::default()
    };
    let client = match pool.client(options) {
        Ok(client) => client,
        Err(e) => {
            result.error = Some(e);
            return result;
        }
    };

    match options.timeout {
        Some(timeout) => {
            match tokio::time::timeout(
                timeout,
                perform(&client, options, &request, &mut result, on_body),
            )
            .await
            {
                Ok(()) => {}
                Err(_) => result.error = Some("operation timed out".to_string()),
            }
        }
        None => perform(&client, options, &request, &mut result, on_body).await,
    }
    result
}

async fn perform(
    client: &HttpClient,
    options: &HttpOptions,
    request: &ProbeRequest,
    result: &mut ProbeResult,
    mut on_body: Option<&mut (dyn FnMut(&[u8]) -> bool + Send + 'static)>,
) {
    let mut url = request.url.clone();
    for _hop in 0..MAX_REDIRECTS {
        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                result.error = Some(format!("invalid URL {}: {}", url, e));
                return;
            }
        };

        let mut builder = http::Request::builder()
            .method(request.verb.clone())
            .uri(uri.clone());
        if let Some((start, end)) = request.range {
            builder = builder.header(header::RANGE, crate::range::format_range(start, end));
        }
        if let Some(ua) = &options.useragent {
            builder = builder.header(header::USER_AGENT, ua);
        }
        if let Some(referer) = &options.referer {
            builder = builder.header(header::REFERER, referer);
        }
        if let Some(cookie) = &options.cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        for (k, v) in options.file_headers() {
            builder = builder.header(k.as_str(), v.as_str());
        }
        for (k, v) in request.extra_headers.iter() {
            builder = builder.header(k, v);
        }
        let req = match builder.body(Full::new(Bytes::new())) {
            Ok(req) => req,
            Err(e) => {
                result.error = Some(format!("build request: {}", e));
                return;
            }
        };

        let resp = match client.request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                result.error = Some(e.to_string());
                return;
            }
        };

        let status = resp.status();
        result.status = status.as_u16();
        result.effective_url = url.clone();
        capture_headers(resp.headers(), result);

        if status.is_redirection() && request.follow_redirects {
            if let Some(location) = resp
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                if let Some(next) = resolve_location(&uri, location) {
                    url = next;
                    continue;
                }
            }
        }

        result.headers = resp.headers().clone();

        if request.header_only {
            return;
        }

        // Detect servers that ignore Range: a 200 (not 206, no
        // Content-Range) on a ranged GET starting past zero, or a body more
        // than ten times the requested window, means ranges are unsupported.
        if request.detect_range_error && status == StatusCode::OK && !result.has_content_range {
            if let Some((start, end)) = request.range {
                let requested = end - start + 1;
                if start != 0 || result.content_length.unwrap_or(0) > 10 * requested {
                    log::warn!("range downloading not supported by server for {}", url);
                    result.range_error = true;
                    return;
                }
            }
        }

        let mut buf = BytesMut::new();
        let mut body = resp.into_body();
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(chunk) = frame.data_ref() {
                        if let Some(cb) = on_body.as_deref_mut() {
                            if !cb(chunk) {
                                result.interrupted = true;
                                return;
                            }
                        }
                        buf.extend_from_slice(chunk);
                    }
                }
                Err(e) => {
                    result.error = Some(e.to_string());
                    break;
                }
            }
        }
        result.body = buf.freeze();
        return;
    }
    result.error = Some(format!("too many redirects for {}", request.url));
}

fn capture_headers(headers: &HeaderMap, result: &mut ProbeResult) {
    result.content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    result.has_content_range = headers.contains_key(header::CONTENT_RANGE);
    result.date_unix = header_date(headers.get(header::DATE));
    result.mtime_unix = header_date(headers.get(header::LAST_MODIFIED));
    result.etag = headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_matches('"').to_string());
    result.azure_resource_type = header_string(headers, "x-ms-resource-type");
    result.azure_permissions = header_string(headers, "x-ms-permissions");
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_date(value: Option<&HeaderValue>) -> u64 {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn resolve_location(base: &Uri, location: &str) -> Option<String> {
    let parsed: Uri = location.parse().ok()?;
    if parsed.scheme().is_some() {
        return Some(location.to_string());
    }
    let scheme = base.scheme_str()?;
    let authority = base.authority()?;
    if location.starts_with('/') {
        return Some(format!("{}://{}{}", scheme, authority, location));
    }
    let path = base.path();
    let dir = &path[..path.rfind('/').map(|i| i + 1).unwrap_or(0)];
    Some(format!("{}://{}{}{}", scheme, authority, dir, location))
}

/// Decide whether a failed attempt is worth retrying: 429, any 5xx, an S3
/// `RequestTimeout` body, or a transient transport error. The returned delay
/// is the one for the attempt after next; the caller sleeps the current one.
pub(crate) fn next_retry_delay(
    status: u16,
    delay: Duration,
    body: &[u8],
    error: Option<&str>,
) -> Option<Duration> {
    let transient_status = status == 429 || (500..=599).contains(&status);
    let transient_body = std::str::from_utf8(body)
        .map(|b| b.contains("RequestTimeout"))
        .unwrap_or(false);
    let transient_error = error
        .map(|e| {
            let e = e.to_ascii_lowercase();
            e.contains("timed out")
                || e.contains("connection reset")
                || e.contains("broken pipe")
                || e.contains("connection closed before")
        })
        .unwrap_or(false);
    if transient_status || transient_body || transient_error {
        Some(delay.mul_f64(2.0))
    } else {
        None
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
