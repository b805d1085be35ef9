use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::auth::{clear_shared_params, lock, AuthProvider};
use crate::cache::{DirListCache, FileProperties, PropertyCache, RegionCache};
use crate::config::Config;
use crate::error::Result;
use crate::handle::VfsHandle;
use crate::transport::ConnectionPool;
use crate::url::{parse_path, url_from_path};

/// The virtual filesystem. Owns the property, region and directory-list
/// caches shared by every handle it opens. Cloning is cheap and clones
/// share the caches.
#[derive(Clone)]
pub struct HttpVfs {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    props: Mutex<PropertyCache>,
    regions: Mutex<RegionCache>,
    dir_lists: Mutex<DirListCache>,
    pool: ConnectionPool,
}

impl HttpVfs {
    /// Configuration from the environment.
    pub fn new() -> Self {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Self {
        let regions = RegionCache::new(config.chunk_size, config.max_regions);
        Self {
            inner: Arc::new(Inner {
                props: Mutex::new(PropertyCache::new()),
                regions: Mutex::new(regions),
                dir_lists: Mutex::new(DirListCache::new()),
                pool: ConnectionPool::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open a `/vsicurl/<url>` or `/vsicurl?key=value&…&url=…` path for
    /// reading. No request is issued yet.
    pub fn open(&self, path: &str) -> Result<VfsHandle> {
        let parsed = parse_path(path)?;
        Ok(VfsHandle::new(self.clone(), path.to_string(), parsed, None))
    }

    /// Open with a credentials provider; the provider's canonical URL
    /// replaces the one in the path.
    pub fn open_with_auth(&self, path: &str, provider: Arc<dyn AuthProvider>) -> Result<VfsHandle> {
        let parsed = parse_path(path)?;
        Ok(VfsHandle::new(
            self.clone(),
            path.to_string(),
            parsed,
            Some(provider),
        ))
    }

    pub async fn size(&self, path: &str) -> Result<u64> {
        let mut handle = self.open(path)?;
        Ok(handle.stat().await?.size)
    }

    pub async fn exists(&self, path: &str) -> bool {
        match self.open(path) {
            Ok(mut handle) => handle.exists().await,
            Err(_) => false,
        }
    }

    /// The URL a virtual path resolves to.
    pub fn actual_url(&self, path: &str) -> Result<String> {
        Ok(parse_path(path)?.url)
    }

    /// Drop every cached property, region and directory listing, the pooled
    /// connections, and the process-wide published auth parameters.
    pub fn clear_cache(&self) {
        lock(&self.inner.props).clear();
        lock(&self.inner.regions).clear();
        lock(&self.inner.dir_lists).clear();
        self.inner.pool.clear();
        clear_shared_params();
    }

    /// Drop all cache entries under a virtual-path prefix.
    pub fn partial_clear_cache(&self, path_prefix: &str) {
        let url_prefix = url_from_path(path_prefix);
        lock(&self.inner.regions).remove_prefix(&url_prefix);
        lock(&self.inner.props).remove_prefix(&url_prefix);
        lock(&self.inner.dir_lists).remove_prefix(path_prefix);
    }

    /// False when the path falls under a configured non-cached prefix, in
    /// which case its handle drops its cache entries on close.
    pub fn allow_cached_data_for(&self, filename: &str) -> bool {
        !self
            .inner
            .config
            .non_cached
            .iter()
            .any(|prefix| filename.starts_with(prefix.as_str()))
    }

    pub fn cached_dir_list(&self, dirname: &str) -> Option<Vec<String>> {
        lock(&self.inner.dir_lists).get(dirname)
    }

    pub fn set_cached_dir_list(&self, dirname: &str, files: Vec<String>) {
        lock(&self.inner.dir_lists).put(dirname, files);
    }

    /// On a cache hit, whether the listing is non-empty.
    pub fn dir_list_cached(&self, dirname: &str) -> Option<bool> {
        lock(&self.inner.dir_lists).contains(dirname)
    }

    pub fn invalidate_dir_list(&self, dirname: &str) {
        lock(&self.inner.dir_lists).remove(dirname);
    }

    pub(crate) fn cached_file_prop(&self, url: &str) -> Option<FileProperties> {
        lock(&self.inner.props).get(url)
    }

    pub(crate) fn set_cached_file_prop(&self, url: &str, props: FileProperties) {
        lock(&self.inner.props).put(url, props);
    }

    pub(crate) fn get_region(&self, url: &str, offset: u64) -> Option<Bytes> {
        lock(&self.inner.regions).get(url, offset)
    }

    pub(crate) fn add_region(&self, url: &str, offset: u64, data: Bytes) {
        lock(&self.inner.regions).insert(url, offset, data);
    }

    pub(crate) fn invalidate_cached_data(&self, url: &str) {
        lock(&self.inner.props).remove(url);
        lock(&self.inner.regions).remove_url(url);
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }
}

impl Default for HttpVfs {
    fn default() -> Self {
        Self::new()
    }
}
