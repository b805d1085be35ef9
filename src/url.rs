use percent_encoding::percent_decode_str;

use crate::error::{Result, VfsError};
use crate::transport::HttpOptions;

pub const VSI_PREFIX: &str = "/vsicurl/";
pub const VSI_QUERY_PREFIX: &str = "/vsicurl?";

const SCHEMES: [&str; 4] = ["http://", "https://", "ftp://", "file://"];

/// A virtual path resolved to its target URL plus the per-open knobs carried
/// in the `/vsicurl?key=value&…` form.
#[derive(Debug, Clone, Default)]
pub struct ParsedUrl {
    pub url: String,
    pub max_retry: Option<u32>,
    pub retry_delay: Option<f64>,
    pub use_head: Option<bool>,
    pub list_dir: Option<bool>,
    pub empty_dir: Option<bool>,
    pub http: HttpOptions,
}

pub fn is_vsi_path(path: &str) -> bool {
    path.starts_with(VSI_PREFIX) || path.starts_with(VSI_QUERY_PREFIX)
}

/// Resolve a virtual path to its URL, parsing knobs from the query form.
pub fn parse_path(path: &str) -> Result<ParsedUrl> {
    if !is_vsi_path(path) {
        return Err(VfsError::InvalidUrl(path.to_string()));
    }
    // Both prefixes are 9 bytes, so this also consumes the `?` of the
    // query form.
    let rest = &path[VSI_PREFIX.len()..];
    if SCHEMES.iter().any(|s| rest.starts_with(s)) {
        return Ok(ParsedUrl {
            url: rest.to_string(),
            ..ParsedUrl::default()
        });
    }

    let rest = rest.strip_prefix('?').unwrap_or(rest);
    let mut parsed = ParsedUrl::default();
    for token in rest.split('&') {
        if token.is_empty() {
            continue;
        }
        let decoded = url_decode(token);
        let Some((key, value)) = decoded.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "url" => parsed.url = value.to_string(),
            "max_retry" => parsed.max_retry = value.parse().ok(),
            "retry_delay" => parsed.retry_delay = value.parse().ok(),
            "use_head" => parsed.use_head = Some(test_bool(value)),
            "list_dir" => parsed.list_dir = Some(test_bool(value)),
            "empty_dir" => parsed.empty_dir = Some(test_bool(value)),
            other => {
                if !parsed.http.set(other, value) {
                    log::warn!("unsupported option: {}", key);
                }
            }
        }
    }
    if parsed.url.is_empty() {
        return Err(VfsError::InvalidUrl(format!("missing url parameter: {}", path)));
    }
    Ok(parsed)
}

/// URL for a path, without interpreting knobs. Non-virtual paths pass
/// through unchanged (useful for prefix-based cache clearing).
pub fn url_from_path(path: &str) -> String {
    match parse_path(path) {
        Ok(parsed) => parsed.url,
        Err(_) if is_vsi_path(path) => path[VSI_PREFIX.len()..].to_string(),
        Err(_) => path.to_string(),
    }
}

fn url_decode(s: &str) -> String {
    match percent_decode_str(s).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s.to_string(),
    }
}

/// Everything except an explicit negative is true.
pub fn test_bool(value: &str) -> bool {
    !matches!(
        value.to_ascii_lowercase().as_str(),
        "no" | "false" | "off" | "0"
    )
}

/// An S3-style presigned URL: only valid for the verb it was signed for.
pub fn is_signed_url(url: &str) -> bool {
    let host_signed = (url.contains(".s3.amazonaws.com/")
        || url.contains(".s3.amazonaws.com:")
        || url.contains(".storage.googleapis.com/")
        || url.contains(".storage.googleapis.com:"))
        && (url.contains("&Signature=") || url.contains("?Signature="));
    host_signed || url.contains("&X-Amz-Signature=") || url.contains("?X-Amz-Signature=")
}

/// Absolute Unix expiry of a presigned URL, from `Expires=` (already a
/// timestamp) or `X-Amz-Expires=` (a delay) combined with `X-Amz-Date=`.
pub fn signed_url_expiry(url: &str) -> Option<u64> {
    if let Some(expires) = query_param(url, "Expires") {
        return expires.parse().ok();
    }
    let delay: u64 = query_param(url, "X-Amz-Expires")?.parse().ok()?;
    let date = parse_amz_date(query_param(url, "X-Amz-Date")?)?;
    Some(date + delay)
}

fn query_param<'a>(url: &'a str, key: &str) -> Option<&'a str> {
    for prefix in ['&', '?'] {
        let needle = format!("{}{}=", prefix, key);
        if let Some(pos) = url.find(&needle) {
            let value = &url[pos + needle.len()..];
            let end = value.find('&').unwrap_or(value.len());
            return Some(&value[..end]);
        }
    }
    None
}

/// `YYYYMMDDTHHMMSSZ` to Unix seconds.
pub fn parse_amz_date(s: &str) -> Option<u64> {
    let s = s.as_bytes();
    if s.len() < 16 || s[8] != b'T' || s[15] != b'Z' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<i64> {
        std::str::from_utf8(&s[range]).ok()?.parse().ok()
    };
    let year = digits(0..4)?;
    let month = digits(4..6)?;
    let day = digits(6..8)?;
    let hour = digits(9..11)?;
    let minute = digits(11..13)?;
    let second = digits(13..15)?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let ts = unix_from_civil(year, month, day) + hour * 3600 + minute * 60 + second;
    u64::try_from(ts).ok()
}

fn unix_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    (era * 146097 + doe - 719468) * 86400
}
