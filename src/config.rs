use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 16_384;
pub const MIN_CHUNK_SIZE: u64 = 1024;
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_CACHE_SIZE: u64 = 16_384_000;
pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 30.0;
pub const DEFAULT_INGESTED_BYTES_AT_OPEN: u64 = 1024;

pub const ENV_CHUNK_SIZE: &str = "CPL_VSIL_CURL_CHUNK_SIZE";
pub const ENV_CACHE_SIZE: &str = "CPL_VSIL_CURL_CACHE_SIZE";
pub const ENV_USE_HEAD: &str = "CPL_VSIL_CURL_USE_HEAD";
pub const ENV_USE_S3_REDIRECT: &str = "CPL_VSIL_CURL_USE_S3_REDIRECT";
pub const ENV_NON_CACHED: &str = "CPL_VSIL_CURL_NON_CACHED";
pub const ENV_MAX_RETRY: &str = "GDAL_HTTP_MAX_RETRY";
pub const ENV_RETRY_DELAY: &str = "GDAL_HTTP_RETRY_DELAY";
pub const ENV_INGESTED_BYTES_AT_OPEN: &str = "GDAL_INGESTED_BYTES_AT_OPEN";

/// Filesystem-wide tuning. `max_regions` is derived from the cache byte
/// budget and bounds the region cache in chunks, never below one.
#[derive(Debug, Clone)]
pub struct Config {
    pub chunk_size: u64,
    pub max_regions: usize,
    pub use_head: bool,
    pub use_s3_redirect: bool,
    /// Virtual-path prefixes whose handles invalidate their cached data on
    /// close (colon-separated in the environment).
    pub non_cached: Vec<String>,
    pub max_retry: u32,
    pub retry_delay: Duration,
    pub ingested_bytes_at_open: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_regions: max_regions_for(DEFAULT_CACHE_SIZE, DEFAULT_CHUNK_SIZE),
            use_head: true,
            use_s3_redirect: true,
            non_cached: Vec::new(),
            max_retry: DEFAULT_MAX_RETRY,
            retry_delay: Duration::from_secs_f64(DEFAULT_RETRY_DELAY_SECS),
            ingested_bytes_at_open: DEFAULT_INGESTED_BYTES_AT_OPEN,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let chunk_size = env_u64(ENV_CHUNK_SIZE)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        let cache_size = env_u64(ENV_CACHE_SIZE).unwrap_or(DEFAULT_CACHE_SIZE);
        let retry_delay = std::env::var(ENV_RETRY_DELAY)
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v >= 0.0)
            .unwrap_or(DEFAULT_RETRY_DELAY_SECS);
        Self {
            chunk_size,
            max_regions: max_regions_for(cache_size, chunk_size),
            use_head: env_bool(ENV_USE_HEAD, true),
            use_s3_redirect: env_bool(ENV_USE_S3_REDIRECT, true),
            non_cached: std::env::var(ENV_NON_CACHED)
                .map(|v| {
                    v.split(':')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            max_retry: env_u64(ENV_MAX_RETRY)
                .map(|v| v as u32)
                .unwrap_or(DEFAULT_MAX_RETRY),
            retry_delay: Duration::from_secs_f64(retry_delay),
            ingested_bytes_at_open: env_u64(ENV_INGESTED_BYTES_AT_OPEN)
                .unwrap_or(DEFAULT_INGESTED_BYTES_AT_OPEN)
                .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
        }
    }

    /// Cache byte budget variant of the default constructor, for embedders
    /// that size the cache programmatically.
    pub fn with_cache_budget(chunk_size: u64, cache_size: u64) -> Self {
        let chunk_size = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        Self {
            chunk_size,
            max_regions: max_regions_for(cache_size, chunk_size),
            ..Self::default()
        }
    }
}

fn max_regions_for(cache_size: u64, chunk_size: u64) -> usize {
    let cache_size = if cache_size < chunk_size {
        DEFAULT_CACHE_SIZE
    } else {
        cache_size
    };
    ((cache_size / chunk_size).max(1)).min(i32::MAX as u64) as usize
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => crate::url::test_bool(&v),
        Err(_) => default,
    }
}
