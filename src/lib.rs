//! Random-access read-only file handles over remote HTTP(S) objects.
//!
//! Arbitrary reads are served from a shared block-aligned range cache;
//! misses coalesce into single range GETs with adaptive readahead. File
//! sizes are discovered with a resilient HEAD/GET probe, and S3-style
//! presigned redirect targets stick around until they expire so repeated
//! reads skip the extra hop.
//!
//! ```no_run
//! # async fn demo() -> httpvfs::Result<()> {
//! let vfs = httpvfs::HttpVfs::new();
//! let mut file = vfs.open("/vsicurl/https://example.com/data.bin")?;
//! let mut buf = vec![0u8; 4096];
//! let n = file.read(&mut buf).await;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
mod fs;
mod handle;
mod lru;
pub mod range;
mod transport;
pub mod url;

pub use auth::{auth_parameters_changed, AuthProvider, RestartDecision};
pub use cache::{Existence, FileProperties, RedirectInfo};
pub use config::Config;
pub use error::{Result, VfsError};
pub use fs::HttpVfs;
pub use handle::{ReadCallback, VfsHandle};
pub use transport::HttpOptions;
