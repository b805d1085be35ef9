use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderMap, Method};

use crate::auth::{publish_shared_params, AuthProvider};
use crate::cache::{parse_unix_permissions, Existence, FileProperties, RedirectInfo, S_IFDIR, S_IFREG};
use crate::error::VfsError;
use crate::fs::HttpVfs;
use crate::range::{align_down, min_blocks, parse_content_range_total, round_up};
use crate::transport::{next_retry_delay, now_unix, probe, HttpOptions, ProbeRequest, ProbeResult};
use crate::url::{is_signed_url, signed_url_expiry, ParsedUrl};

/// Runs inside the HTTP body writer; returning false aborts the download.
pub type ReadCallback = Box<dyn FnMut(&[u8]) -> bool + Send>;

const MAX_PREFETCH_BLOCKS: u64 = 100;

/// One open remote file. Cheap to create: no request is made until the
/// first read or size query.
pub struct VfsHandle {
    fs: HttpVfs,
    filename: String,
    url: String,
    options: HttpOptions,
    max_retry: u32,
    retry_delay: Duration,
    use_head: bool,
    auth: Option<Arc<dyn AuthProvider>>,
    props: FileProperties,
    offset: u64,
    eof: bool,
    blocks_to_download: u64,
    last_downloaded_offset: Option<u64>,
    read_cb: Option<ReadCallback>,
    stop_on_interrupt: bool,
    interrupted: bool,
    cached: bool,
    last_error: Option<VfsError>,
}

impl VfsHandle {
    pub(crate) fn new(
        fs: HttpVfs,
        filename: String,
        parsed: ParsedUrl,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        let config = fs.config();
        let url = match &auth {
            Some(provider) => provider.url(),
            None => parsed.url.clone(),
        };
        let max_retry = parsed.max_retry.unwrap_or(config.max_retry);
        let retry_delay = parsed
            .retry_delay
            .filter(|v| *v >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(config.retry_delay);
        let use_head = parsed.use_head.unwrap_or(config.use_head);
        let cached = fs.allow_cached_data_for(&filename);
        let props = fs.cached_file_prop(&url).unwrap_or_default();
        Self {
            fs,
            filename,
            url,
            options: parsed.http,
            max_retry,
            retry_delay,
            use_head,
            auth,
            props,
            offset: 0,
            eof: false,
            blocks_to_download: 1,
            last_downloaded_offset: None,
            read_cb: None,
            stop_on_interrupt: false,
            interrupted: false,
            cached,
            last_error: None,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The resolved target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// No-op: the handle is read-only.
    pub fn flush(&mut self) {}

    pub async fn seek(&mut self, pos: SeekFrom) -> u64 {
        match pos {
            SeekFrom::Start(offset) => self.offset = offset,
            SeekFrom::Current(delta) => self.offset = self.offset.saturating_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.size().await;
                self.offset = size.saturating_add_signed(delta);
            }
        }
        self.eof = false;
        self.offset
    }

    /// File size in bytes; 0 when the object is missing. Failures are
    /// silent here, use [`stat`](Self::stat) to surface them.
    pub async fn size(&mut self) -> u64 {
        self.ensure_size().await;
        self.props.size
    }

    pub async fn exists(&mut self) -> bool {
        self.ensure_size().await;
        self.props.existence == Existence::Yes
    }

    /// Full properties, raising the last probe error when the object could
    /// not be reached.
    pub async fn stat(&mut self) -> crate::Result<FileProperties> {
        self.ensure_size().await;
        if self.props.existence == Existence::No {
            return Err(self
                .last_error
                .clone()
                .unwrap_or(VfsError::Http(404)));
        }
        Ok(self.props.clone())
    }

    /// Install the per-download byte callback. Fails when one is installed
    /// already. With `stop_on_interrupt_until_uninstall`, an interrupting
    /// callback turns all further reads into no-ops until uninstalled.
    pub fn install_read_callback(
        &mut self,
        callback: ReadCallback,
        stop_on_interrupt_until_uninstall: bool,
    ) -> bool {
        if self.read_cb.is_some() {
            return false;
        }
        self.read_cb = Some(callback);
        self.stop_on_interrupt = stop_on_interrupt_until_uninstall;
        self.interrupted = false;
        true
    }

    pub fn uninstall_read_callback(&mut self) -> bool {
        if self.read_cb.is_none() {
            return false;
        }
        self.read_cb = None;
        self.stop_on_interrupt = false;
        self.interrupted = false;
        true
    }

    fn allow_redirects(&self) -> bool {
        self.auth
            .as_ref()
            .map(|a| a.allow_automatic_redirection())
            .unwrap_or(true)
    }

    fn build_auth_headers(&self, verb: &Method) -> HeaderMap {
        match &self.auth {
            Some(provider) => provider.build_headers(verb, &HeaderMap::new()),
            None => HeaderMap::new(),
        }
    }

    /// Ask the auth provider whether a fresh attempt can succeed (wrong
    /// region, expired token). On restart the provider may have moved the
    /// canonical URL.
    fn can_restart_on_error(&mut self, res: &ProbeResult, set_error: bool) -> bool {
        let Some(provider) = &self.auth else {
            return false;
        };
        let body = String::from_utf8_lossy(&res.body);
        let headers = headers_to_string(&res.headers);
        let decision = provider.can_restart_on_error(&body, &headers, set_error);
        if !decision.restart {
            return false;
        }
        if decision.publish_params {
            publish_shared_params(&provider.url(), provider.export_params());
        }
        self.url = provider.url();
        true
    }

    async fn ensure_size(&mut self) {
        if let Some(props) = self.fs.cached_file_prop(&self.url) {
            self.props = props;
        }
        if self.props.has_computed_size {
            return;
        }
        self.discover().await;
    }

    /// Populate the file properties with one (or a few) probes: HEAD with
    /// GET fallbacks, or a ranged GET that seeds the region cache when the
    /// backend dislikes HEAD.
    async fn discover(&mut self) {
        let chunk_size = self.fs.config().chunk_size;
        let use_s3_redirect = self.fs.config().use_s3_redirect;
        let limit_range_get = self
            .auth
            .as_ref()
            .map(|a| a.use_limit_range_get())
            .unwrap_or(false);
        let follow = self.allow_redirects();
        let fs = self.fs.clone();
        let options = self.options.clone();

        let mut url = self.url.clone();
        let mut retry_with_get = false;
        let mut s3_like_redirect = false;
        let mut retry_count = 0u32;
        let mut retry_delay = self.retry_delay;

        let final_props = loop {
            let mut header_only = false;
            let mut range = None;
            let verb;
            if limit_range_get {
                verb = Method::GET;
                let ingest = round_up(self.fs.config().ingested_bytes_at_open, chunk_size);
                range = Some((0, ingest - 1));
            } else if retry_with_get
                || url.contains(".tiles.mapbox.com/")
                || is_signed_url(&url)
                || !self.use_head
            {
                verb = Method::GET;
                header_only = true;
            } else {
                verb = Method::HEAD;
            }

            let request = ProbeRequest {
                verb: verb.clone(),
                url: url.clone(),
                range,
                header_only,
                detect_range_error: false,
                follow_redirects: follow,
                extra_headers: self.build_auth_headers(&verb),
            };
            let res = probe(fs.pool(), &options, request, None).await;

            let mut props = FileProperties {
                has_computed_size: true,
                ..FileProperties::default()
            };

            if url.starts_with("ftp") {
                if let Some(size) = scan_body_size(&res.body, "Content-Length: ") {
                    props.existence = Existence::Yes;
                    props.size = size;
                }
            }

            if props.existence != Existence::Yes {
                let status = res.status;
                let effective = res.effective_url.clone();
                let effective_changed = !effective.is_empty() && !effective.contains(url.as_str());

                if effective_changed && is_signed_url(&effective) && !is_signed_url(&url) {
                    // The redirect will be invisible after the retry.
                    s3_like_redirect = true;
                    if !retry_with_get && verb == Method::HEAD && status == 403 {
                        log::debug!(
                            "redirected to a signed URL; retrying with GET since the \
                             signature might only be valid for GET"
                        );
                        retry_with_get = true;
                        url = effective;
                        continue;
                    }
                }

                if s3_like_redirect
                    && (200..300).contains(&status)
                    && res.date_unix > 0
                    && use_s3_redirect
                {
                    if let Some(expiry) = signed_url_expiry(&effective) {
                        if expiry > res.date_unix + 10 {
                            let validity = expiry - res.date_unix;
                            log::debug!("will use redirect URL for the next {}s", validity);
                            props.redirect = Some(RedirectInfo {
                                url: effective.clone(),
                                local_expiry_unix: now_unix() + validity,
                            });
                        }
                    }
                }

                props.existence = Existence::Yes;
                match res.content_length {
                    Some(len) => props.size = len,
                    None => {
                        if verb == Method::HEAD && !retry_with_get && status == 200 {
                            log::debug!("HEAD did not provide a file size; retrying with GET");
                            retry_with_get = true;
                            continue;
                        }
                        props.size = 0;
                    }
                }

                if status == 200 || status == 206 {
                    if let Some(etag) = &res.etag {
                        props.etag = etag.clone();
                    }
                    if let Some(resource_type) = &res.azure_resource_type {
                        let is_dir = resource_type == "directory";
                        if is_dir || resource_type == "file" {
                            props.is_directory = is_dir;
                            let mut mode = if is_dir { S_IFDIR } else { S_IFREG };
                            if let Some(perms) = &res.azure_permissions {
                                mode |= parse_unix_permissions(perms);
                            }
                            props.mode = mode;
                        }
                    }
                }

                if limit_range_get && status == 206 {
                    props.set_missing();
                    if let Some(total) = content_range_total(&res.headers) {
                        props.existence = Existence::Yes;
                        props.size = total;
                    }
                    // Seed the cache with the ingested bytes, whole chunks only.
                    let mut offset = 0u64;
                    while offset + chunk_size <= res.body.len() as u64 {
                        fs.add_region(
                            &self.url,
                            offset,
                            res.body.slice(offset as usize..(offset + chunk_size) as usize),
                        );
                        offset += chunk_size;
                    }
                } else if status == 405 && !retry_with_get && verb == Method::HEAD {
                    log::debug!("HEAD not allowed; retrying with GET");
                    retry_with_get = true;
                    continue;
                } else if status == 416 {
                    props.existence = Existence::Yes;
                    props.size = 0;
                } else if status != 200 {
                    if retry_count < self.max_retry {
                        if let Some(next) =
                            next_retry_delay(status, retry_delay, &res.body, res.error.as_deref())
                        {
                            log::warn!(
                                "HTTP error code: {} - {}. Retrying again in {:.1} secs",
                                status,
                                self.url,
                                retry_delay.as_secs_f64()
                            );
                            tokio::time::sleep(retry_delay).await;
                            retry_delay = next;
                            retry_count += 1;
                            continue;
                        }
                    }
                    // A restarting provider reconfigured itself (region,
                    // endpoint, token); start over with fresh retry budget,
                    // as many times as it keeps saying it can.
                    if limit_range_get
                        && !res.body.is_empty()
                        && self.can_restart_on_error(&res, true)
                    {
                        retry_with_get = false;
                        s3_like_redirect = false;
                        retry_count = 0;
                        retry_delay = self.retry_delay;
                        url = self.url.clone();
                        continue;
                    }
                    self.last_error = Some(probe_error(status, &res));
                    if status != 400 && status != 404 {
                        log::warn!("HTTP response code on {}: {}", url, status);
                    }
                    props.set_missing();
                } else if url.starts_with("ftp") {
                    if let Some(size) = scan_body_size(&res.body, "213 ") {
                        props.existence = Existence::Yes;
                        props.size = size;
                    }
                }

                // Servers answer directory URLs by redirecting to the
                // slash-terminated form.
                if effective == format!("{}/", url) {
                    props.existence = Existence::Yes;
                    props.size = 0;
                    props.is_directory = true;
                } else if url.ends_with('/') {
                    props.is_directory = true;
                }

                log::debug!("size({}) = {} response_code={}", url, props.size, status);
            }

            if res.mtime_unix > 0 {
                props.mtime = res.mtime_unix;
            }
            break props;
        };

        self.fs.set_cached_file_prop(&self.url, final_props.clone());
        self.props = final_props;
    }

    /// Fetch `n_blocks` contiguous chunks starting at `start_offset` (a
    /// multiple of the chunk size) and insert them into the region cache.
    /// Returns the raw body, or None on failure/interrupt.
    async fn download_region(&mut self, start_offset: u64, n_blocks: u64) -> Option<Bytes> {
        if self.interrupted && self.stop_on_interrupt {
            return None;
        }
        if self.props.existence == Existence::No {
            return None;
        }

        let chunk_size = self.fs.config().chunk_size;
        let use_s3_redirect = self.fs.config().use_s3_redirect;
        let follow = self.allow_redirects();
        let fs = self.fs.clone();
        let options = self.options.clone();

        if let Some(props) = fs.cached_file_prop(&self.url) {
            self.props = props;
        }
        let mut url = self.url.clone();
        let mut used_redirect = false;
        match self.props.redirect.clone() {
            Some(redirect) if now_unix() + 1 < redirect.local_expiry_unix => {
                log::debug!(
                    "using redirect URL, still valid for {}s",
                    redirect.local_expiry_unix - now_unix()
                );
                url = redirect.url;
                used_redirect = true;
            }
            Some(_) => {
                log::debug!("redirect URL has expired; using original URL");
                self.props.redirect = None;
                fs.set_cached_file_prop(&self.url, self.props.clone());
            }
            None => {}
        }

        let mut retry_count = 0u32;
        let mut retry_delay = self.retry_delay;

        loop {
            let mut end_offset = start_offset + n_blocks * chunk_size - 1;
            if self.props.has_computed_size && self.props.size > 0 && end_offset >= self.props.size
            {
                // Some servers dislike ranges past end-of-file.
                end_offset = self.props.size - 1;
            }
            log::debug!("downloading {}-{} ({})", start_offset, end_offset, url);

            let request = ProbeRequest {
                verb: Method::GET,
                url: url.clone(),
                range: Some((start_offset, end_offset)),
                header_only: false,
                detect_range_error: true,
                follow_redirects: follow,
                extra_headers: self.build_auth_headers(&Method::GET),
            };
            let res = probe(fs.pool(), &options, request, self.read_cb.as_deref_mut()).await;

            if res.interrupted {
                self.interrupted = true;
                return None;
            }
            let status = res.status;

            if res.mtime_unix > 0 {
                self.props.mtime = res.mtime_unix;
                fs.set_cached_file_prop(&self.url, self.props.clone());
            }

            if status == 403 && used_redirect {
                log::debug!("got an error with redirect URL; retrying with original one");
                self.props.redirect = None;
                fs.set_cached_file_prop(&self.url, self.props.clone());
                used_redirect = false;
                url = self.url.clone();
                continue;
            }

            if status == 401 {
                if retry_count < self.max_retry {
                    retry_count += 1;
                    log::debug!("unauthorized, trying to authenticate");
                    let authenticated = self
                        .auth
                        .as_ref()
                        .map(|a| a.authenticate())
                        .unwrap_or(false);
                    if authenticated {
                        continue;
                    }
                }
                self.last_error = Some(VfsError::Unauthorized);
                return None;
            }

            let effective = res.effective_url.clone();
            if self.props.redirect.is_none()
                && (200..300).contains(&status)
                && res.date_unix > 0
                && !effective.is_empty()
                && !effective.contains(self.url.as_str())
                && is_signed_url(&effective)
                && !is_signed_url(&self.url)
                && use_s3_redirect
            {
                if let Some(expiry) = signed_url_expiry(&effective) {
                    if expiry > res.date_unix + 10 {
                        let validity = expiry - res.date_unix;
                        log::debug!("will use redirect URL for the next {}s", validity);
                        self.props.redirect = Some(RedirectInfo {
                            url: effective.clone(),
                            local_expiry_unix: now_unix() + validity,
                        });
                        fs.set_cached_file_prop(&self.url, self.props.clone());
                    }
                }
            }

            let acceptable = matches!(status, 200 | 206 | 225 | 226 | 426);
            if !acceptable || res.range_error {
                // Provider-driven restart: fresh attempt with fresh budget,
                // until the provider stops claiming it can recover.
                if !res.body.is_empty() && self.can_restart_on_error(&res, false) {
                    url = self.url.clone();
                    used_redirect = false;
                    retry_count = 0;
                    retry_delay = self.retry_delay;
                    continue;
                }
                if retry_count < self.max_retry {
                    if let Some(next) =
                        next_retry_delay(status, retry_delay, &res.body, res.error.as_deref())
                    {
                        log::warn!(
                            "HTTP error code: {} - {}. Retrying again in {:.1} secs",
                            status,
                            self.url,
                            retry_delay.as_secs_f64()
                        );
                        tokio::time::sleep(retry_delay).await;
                        retry_delay = next;
                        retry_count += 1;
                        continue;
                    }
                }
                self.last_error = Some(if res.range_error {
                    VfsError::RangeNotSupported
                } else {
                    probe_error(status, &res)
                });
                if !self.props.has_computed_size && start_offset == 0 {
                    self.props.has_computed_size = true;
                    self.props.set_missing();
                    fs.set_cached_file_prop(&self.url, self.props.clone());
                }
                return None;
            }

            if !self.props.has_computed_size {
                // Learn the size on the fly from "Content-Range: a-b/total".
                if let Some(total) = content_range_total(&res.headers) {
                    self.props.size = total;
                } else if self.url.starts_with("ftp") {
                    if let Some(size) = scan_body_size(&res.body, "213 ") {
                        self.props.size = size;
                    }
                }
                if self.props.size != 0 {
                    log::debug!("size({}) = {} response_code={}", self.url, self.props.size, status);
                    self.props.existence = Existence::Yes;
                    self.props.has_computed_size = true;
                    fs.set_cached_file_prop(&self.url, self.props.clone());
                }
            }

            self.last_downloaded_offset = Some(start_offset + n_blocks * chunk_size);
            if res.body.len() as u64 > n_blocks * chunk_size {
                log::debug!(
                    "got more data than expected: {} instead of {}",
                    res.body.len(),
                    n_blocks * chunk_size
                );
            }
            let mut offset = start_offset;
            let mut remaining = res.body.clone();
            while !remaining.is_empty() {
                let take = remaining.len().min(chunk_size as usize);
                fs.add_region(&self.url, offset, remaining.slice(..take));
                remaining = remaining.slice(take..);
                offset += take as u64;
            }
            return Some(res.body);
        }
    }

    /// Read at the current offset, returning the number of bytes copied.
    /// A short count sets the EOF flag.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        if self.interrupted && self.stop_on_interrupt {
            return 0;
        }
        let chunk_size = self.fs.config().chunk_size;
        let max_regions = self.fs.config().max_regions as u64;
        let start_offset = self.offset;
        let mut iter_offset = self.offset;
        let mut remaining = buf.len() as u64;

        while remaining > 0 {
            // Cheap refresh so concurrent handles share a freshly learned size.
            if let Some(props) = self.fs.cached_file_prop(&self.url) {
                self.props = props;
            }
            if self.props.has_computed_size && iter_offset >= self.props.size {
                if iter_offset == start_offset {
                    log::debug!("request at offset {}, after end of file", iter_offset);
                }
                break;
            }

            let block_offset = align_down(iter_offset, chunk_size);
            let region = match self.fs.get_region(&self.url, block_offset) {
                Some(region) => region,
                None => {
                    if self.last_downloaded_offset == Some(block_offset) {
                        // Consecutive reads: assume a sequential scan and
                        // widen the request to cut round trips.
                        if self.blocks_to_download < MAX_PREFETCH_BLOCKS {
                            self.blocks_to_download *= 2;
                        }
                    } else {
                        // Random access cancels the heuristic.
                        self.blocks_to_download = 1;
                    }

                    let needed = min_blocks(block_offset, iter_offset + remaining, chunk_size);
                    if self.blocks_to_download < needed {
                        self.blocks_to_download = needed;
                    }
                    // Shrink to the first already-cached block; re-downloading
                    // cached data is the worse deal.
                    for i in 1..self.blocks_to_download {
                        if self
                            .fs
                            .get_region(&self.url, block_offset + i * chunk_size)
                            .is_some()
                        {
                            self.blocks_to_download = i;
                            break;
                        }
                    }
                    if self.blocks_to_download > max_regions {
                        self.blocks_to_download = max_regions;
                    }

                    let blocks = self.blocks_to_download;
                    match self.download_region(block_offset, blocks).await {
                        Some(body) if !body.is_empty() => body,
                        _ => {
                            if !self.interrupted {
                                self.eof = true;
                            }
                            return 0;
                        }
                    }
                }
            };

            let region_offset = iter_offset - block_offset;
            if (region.len() as u64) < region_offset {
                if iter_offset == start_offset {
                    log::debug!("request at offset {}, after end of file", iter_offset);
                }
                break;
            }

            let to_copy = remaining.min(region.len() as u64 - region_offset) as usize;
            let dst_start = (iter_offset - start_offset) as usize;
            buf[dst_start..dst_start + to_copy].copy_from_slice(
                &region[region_offset as usize..region_offset as usize + to_copy],
            );
            iter_offset += to_copy as u64;
            remaining -= to_copy as u64;
            if (region.len() as u64) < chunk_size && remaining > 0 {
                break;
            }
        }

        let read = (iter_offset - start_offset) as usize;
        if read < buf.len() {
            self.eof = true;
        }
        self.offset = iter_offset;
        read
    }
}

impl Drop for VfsHandle {
    fn drop(&mut self) {
        if !self.cached {
            self.fs.invalidate_cached_data(&self.url);
        }
    }
}

fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total)
}

fn probe_error(status: u16, res: &ProbeResult) -> VfsError {
    if status == 0 {
        VfsError::Transport(
            res.error
                .clone()
                .unwrap_or_else(|| "unknown transport error".to_string()),
        )
    } else {
        VfsError::Http(status)
    }
}

fn headers_to_string(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or(""));
        out.push_str("\r\n");
    }
    out
}

/// Scan a protocol response body for `<marker><decimal size>`, as FTP
/// transfers report sizes via `Content-Length:` or a `213 ` status line.
fn scan_body_size(body: &[u8], marker: &str) -> Option<u64> {
    let body = std::str::from_utf8(body).ok()?;
    let pos = body.find(marker)?;
    let rest = &body[pos + marker.len()..];
    let end = rest
        .find(|c: char| c == '\r' || c == '\n')
        .unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_ftp_size_lines() {
        assert_eq!(
            scan_body_size(b"213 123456\r\n", "213 "),
            Some(123_456)
        );
        assert_eq!(
            scan_body_size(b"banner\r\nContent-Length: 42\r\nmore", "Content-Length: "),
            Some(42)
        );
        assert_eq!(scan_body_size(b"213 xyz\r\n", "213 "), None);
        assert_eq!(scan_body_size(b"no marker", "213 "), None);
    }

    #[test]
    fn headers_flatten_for_restart_hook() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-region", http::HeaderValue::from_static("eu-west-1"));
        let s = headers_to_string(&headers);
        assert!(s.contains("x-amz-region: eu-west-1\r\n"));
    }
}
