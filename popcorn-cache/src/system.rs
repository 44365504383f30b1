//! System-header digest cache
//!
//! Headers under the OS header root exist on the server too, so their
//! content never needs to travel. This cache hashes such files once and
//! revalidates by mtime and size, letting the session layer satisfy
//! system-header requirements without materializing anything.

use crate::identity::FileIdentityCache;
use popcorn_protocol::ContentDigest;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Default OS header root
const SYSTEM_HEADER_ROOT: &str = "/usr/";

/// Digests of headers shared with the server's own filesystem
#[derive(Debug)]
pub struct SystemHeaderCache {
    root: PathBuf,
    files: FileIdentityCache,
}

impl Default for SystemHeaderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHeaderCache {
    /// Cache for headers under `/usr/`
    pub fn new() -> Self {
        Self::with_root(SYSTEM_HEADER_ROOT)
    }

    /// Cache for headers under a custom root (used by tests)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: FileIdentityCache::default(),
        }
    }

    /// Digest of the server-local file at `path`, or `None` when the path
    /// lies outside the header root or cannot be read. Hashes on first
    /// demand and revalidates by `(mtime, size)`.
    pub async fn digest_for(&self, path: &str) -> Option<ContentDigest> {
        if !Path::new(path).starts_with(&self.root) {
            return None;
        }
        let meta = tokio::fs::metadata(path).await.ok()?;
        let mtime_ns = meta
            .modified()
            .ok()?
            .duration_since(UNIX_EPOCH)
            .ok()?
            .as_nanos() as i64;
        let size = meta.len() as i64;

        if let Some(digest) = self.files.get(path, mtime_ns, size) {
            return Some(digest);
        }

        let digest = ContentDigest::of_file(path).await.ok()?;
        debug!("Hashed system header {path}: {digest}");
        self.files.set(path, mtime_ns, size, digest);
        Some(digest)
    }

    /// Number of hashed system headers
    pub fn len(&self) -> u64 {
        self.files.len()
    }

    /// True when nothing has been hashed yet
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
