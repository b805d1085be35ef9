use bytes::Bytes;

use crate::auth::auth_generation;
use crate::lru::LruMap;
use crate::range::align_down;

const PROPERTY_CACHE_SIZE: usize = 100 * 1024;
const DIR_LIST_CACHE_SIZE: usize = 1024;
const DIR_LIST_MAX_TOTAL_FILES: usize = 1024 * 1024;

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Existence {
    #[default]
    Unknown,
    Yes,
    No,
}

/// Cached redirect target for a URL, expiring on the reader's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    pub url: String,
    pub local_expiry_unix: u64,
}

/// Everything known about one URL.
#[derive(Debug, Clone, Default)]
pub struct FileProperties {
    pub existence: Existence,
    pub has_computed_size: bool,
    pub size: u64,
    /// Seconds since epoch, 0 when unset.
    pub mtime: u64,
    pub is_directory: bool,
    pub etag: String,
    /// POSIX mode bits, 0 when unset.
    pub mode: u32,
    pub redirect: Option<RedirectInfo>,
    pub(crate) auth_generation: u32,
}

impl FileProperties {
    pub(crate) fn set_missing(&mut self) {
        self.existence = Existence::No;
        self.size = 0;
    }
}

/// `rwxrwxrwx` to permission bits; anything else is 0.
pub fn parse_unix_permissions(perms: &str) -> u32 {
    let bytes = perms.as_bytes();
    if bytes.len() != 9 {
        return 0;
    }
    let mut mode = 0u32;
    for (i, &ch) in bytes.iter().enumerate() {
        if ch != b'-' {
            mode |= 0o400 >> i;
        }
    }
    mode
}

pub(crate) struct PropertyCache {
    entries: LruMap<String, FileProperties>,
}

impl PropertyCache {
    pub fn new() -> Self {
        Self {
            entries: LruMap::new(PROPERTY_CACHE_SIZE),
        }
    }

    /// A negative entry recorded under an older auth epoch is reported as
    /// missing so new credentials get a fresh probe.
    pub fn get(&mut self, url: &str) -> Option<FileProperties> {
        let props = self.entries.get(&url.to_string())?;
        if props.existence == Existence::No && props.auth_generation != auth_generation() {
            return None;
        }
        Some(props.clone())
    }

    pub fn put(&mut self, url: &str, mut props: FileProperties) {
        props.auth_generation = auth_generation();
        self.entries.insert(url.to_string(), props);
    }

    pub fn remove(&mut self, url: &str) {
        self.entries.remove(&url.to_string());
    }

    pub fn remove_prefix(&mut self, prefix: &str) {
        self.entries.remove_matching(|k, _| k.starts_with(prefix));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub(crate) struct RegionCache {
    chunk_size: u64,
    entries: LruMap<(String, u64), Bytes>,
}

impl RegionCache {
    pub fn new(chunk_size: u64, max_regions: usize) -> Self {
        Self {
            chunk_size,
            entries: LruMap::new(max_regions),
        }
    }

    pub fn get(&mut self, url: &str, offset: u64) -> Option<Bytes> {
        let key = (url.to_string(), align_down(offset, self.chunk_size));
        self.entries.get(&key).cloned()
    }

    pub fn insert(&mut self, url: &str, offset: u64, data: Bytes) {
        self.entries.insert((url.to_string(), offset), data);
    }

    pub fn remove_url(&mut self, url: &str) {
        self.entries.remove_matching(|(u, _), _| u == url);
    }

    pub fn remove_prefix(&mut self, prefix: &str) {
        self.entries.remove_matching(|(u, _), _| u.starts_with(prefix));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

struct DirListEntry {
    files: Vec<String>,
    auth_generation: u32,
}

/// Directory listings, bounded both by entry count and by the summed file
/// count across entries. Whole oldest entries go until both bounds hold.
pub(crate) struct DirListCache {
    entries: LruMap<String, DirListEntry>,
    total_files: usize,
}

impl DirListCache {
    pub fn new() -> Self {
        Self {
            entries: LruMap::new(DIR_LIST_CACHE_SIZE),
            total_files: 0,
        }
    }

    pub fn get(&mut self, dirname: &str) -> Option<Vec<String>> {
        let entry = self.entries.get(&dirname.to_string())?;
        if entry.auth_generation != auth_generation() {
            return None;
        }
        Some(entry.files.clone())
    }

    pub fn contains(&mut self, dirname: &str) -> Option<bool> {
        self.get(dirname).map(|files| !files.is_empty())
    }

    pub fn put(&mut self, dirname: &str, files: Vec<String>) {
        if let Some(old) = self.entries.remove(&dirname.to_string()) {
            self.total_files -= old.files.len();
        }
        while !self.entries.is_empty()
            && (self.total_files + files.len() > DIR_LIST_MAX_TOTAL_FILES
                || self.entries.len() >= DIR_LIST_CACHE_SIZE)
        {
            if let Some((_, old)) = self.entries.pop_oldest() {
                self.total_files -= old.files.len();
            }
        }
        self.total_files += files.len();
        self.entries.insert(
            dirname.to_string(),
            DirListEntry {
                files,
                auth_generation: auth_generation(),
            },
        );
    }

    pub fn remove(&mut self, dirname: &str) {
        if let Some(old) = self.entries.remove(&dirname.to_string()) {
            self.total_files -= old.files.len();
        }
    }

    pub fn remove_prefix(&mut self, prefix: &str) {
        let mut dropped = 0;
        self.entries.remove_matching(|k, v| {
            if k.starts_with(prefix) {
                dropped += v.files.len();
                true
            } else {
                false
            }
        });
        self.total_files -= dropped;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_files = 0;
    }
}
