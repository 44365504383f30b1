//! In-flight transfer registry
//!
//! When several sessions need the same uncached blob, only one of them
//! should push its bytes over the network; the others wait for the cache to
//! fill. This registry hands out the upload claim per `(basename, digest)`
//! pair. A claim older than the stale threshold is presumed stuck and may
//! be taken over.

use parking_lot::Mutex;
use popcorn_protocol::ContentDigest;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// Claims older than this are presumed stuck and can be retaken
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransferKey {
    name: String,
    digest: ContentDigest,
}

impl TransferKey {
    fn new(path: &str, digest: ContentDigest) -> Self {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        Self {
            name: name.to_string(),
            digest,
        }
    }
}

/// Deduplicator for concurrent uploads of one blob
#[derive(Debug)]
pub struct TransferRegistry {
    table: Mutex<HashMap<TransferKey, Instant>>,
    stale_after: Duration,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    /// Registry with the default 5 s stale threshold
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER)
    }

    /// Registry with a custom stale threshold
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::with_capacity(1024)),
            stale_after,
        }
    }

    /// Try to claim the upload of `(basename(path), digest)`. Returns true
    /// when the caller became the uploader, either because nobody held the
    /// claim or because the holder's claim went stale.
    pub fn start(&self, path: &str, digest: ContentDigest) -> bool {
        let key = TransferKey::new(path, digest);
        let now = Instant::now();
        let mut table = self.table.lock();
        match table.get(&key) {
            Some(started) if now.duration_since(*started) <= self.stale_after => false,
            _ => {
                table.insert(key, now);
                true
            }
        }
    }

    /// Claim the upload unconditionally. Used by a waiter that has given
    /// up on the current holder.
    pub fn force_start(&self, path: &str, digest: ContentDigest) {
        let key = TransferKey::new(path, digest);
        self.table.lock().insert(key, Instant::now());
    }

    /// Release the claim once the upload finished or failed
    pub fn finish(&self, path: &str, digest: ContentDigest) {
        let key = TransferKey::new(path, digest);
        self.table.lock().remove(&key);
    }

    /// Number of uploads currently claimed
    pub fn len(&self) -> u64 {
        self.table.lock().len() as u64
    }

    /// True when no upload is claimed
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_claim_per_blob() {
        let registry = TransferRegistry::new();
        let digest = ContentDigest::of_bytes(b"header");

        assert!(registry.start("/inc/h1.h", digest));
        assert!(!registry.start("/inc/h1.h", digest));
        // Same basename from another directory is still the same blob.
        assert!(!registry.start("/other/h1.h", digest));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_content_claims_independently() {
        let registry = TransferRegistry::new();
        let a = ContentDigest::of_bytes(b"a");
        let b = ContentDigest::of_bytes(b"b");

        assert!(registry.start("/inc/h1.h", a));
        assert!(registry.start("/inc/h1.h", b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_finish_releases_claim() {
        let registry = TransferRegistry::new();
        let digest = ContentDigest::of_bytes(b"header");

        assert!(registry.start("/inc/h1.h", digest));
        registry.finish("/inc/h1.h", digest);
        assert!(registry.start("/inc/h1.h", digest));
    }

    #[test]
    fn test_stale_claim_can_be_retaken() {
        let registry = TransferRegistry::with_stale_after(Duration::from_millis(0));
        let digest = ContentDigest::of_bytes(b"header");

        assert!(registry.start("/inc/h1.h", digest));
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.start("/inc/h1.h", digest));
    }

    #[test]
    fn test_force_start_overwrites() {
        let registry = TransferRegistry::new();
        let digest = ContentDigest::of_bytes(b"header");

        assert!(registry.start("/inc/h1.h", digest));
        registry.force_start("/inc/h1.h", digest);
        // The forced claim is fresh, so a regular start loses again.
        assert!(!registry.start("/inc/h1.h", digest));
        assert_eq!(registry.len(), 1);
    }
}
