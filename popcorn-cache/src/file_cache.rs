//! Bounded content-addressed file cache
//!
//! [`FileCache`] persists blobs keyed by `(basename, digest, extra key)` on a
//! local filesystem and hands them out by hard link, so a materialized copy
//! costs one directory entry and no data movement. The basename is part of
//! the key because debug info inside cached objects references the file name
//! the compiler saw; the extra key discriminates object files built from the
//! same inputs with different argv.
//!
//! Entries live on an LRU list whose nodes sit in a slab arena and link to
//! each other by index, which keeps promotion and tail-eviction O(1) without
//! pointer cycles. A single mutex guards the table and the list; sizes and
//! counters are atomics so stats reads never take the lock. Insertion evicts
//! down to the hard limit; the housekeeping loop evicts down to the soft
//! limit (80% of hard).
//!
//! Cache files are spread over 256 shard subdirectories by the unique
//! insertion counter, keeping per-directory entry counts manageable for
//! filesystems that degrade on huge directories.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use popcorn_protocol::ContentDigest;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Number of shard subdirectories
const DIR_SHARDS: u64 = 256;

/// Full cache key of one stored blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    digest: ContentDigest,
    extra: String,
}

#[derive(Debug)]
struct CachedFile {
    path_in_cache: PathBuf,
    size: u64,
    node: usize,
}

#[derive(Debug)]
struct LruNode {
    prev: Option<usize>,
    next: Option<usize>,
    key: CacheKey,
}

/// Doubly-linked LRU over a slab arena; nodes refer to each other by index
#[derive(Debug, Default)]
struct LruList {
    nodes: Vec<Option<LruNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruList {
    fn node(&self, index: usize) -> &LruNode {
        match &self.nodes[index] {
            Some(node) => node,
            None => unreachable!("LRU index {index} points at a freed node"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut LruNode {
        match &mut self.nodes[index] {
            Some(node) => node,
            None => unreachable!("LRU index {index} points at a freed node"),
        }
    }

    fn push_front(&mut self, key: CacheKey) -> usize {
        let node = LruNode {
            prev: None,
            next: self.head,
            key,
        };
        let index = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        if let Some(old_head) = self.head {
            self.node_mut(old_head).prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        index
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    fn promote(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        let old_head = self.head;
        let node = self.node_mut(index);
        node.prev = None;
        node.next = old_head;
        if let Some(old_head) = self.head {
            self.node_mut(old_head).prev = Some(index);
        }
        self.head = Some(index);
    }

    fn pop_back(&mut self) -> Option<CacheKey> {
        let index = self.tail?;
        self.unlink(index);
        let node = self.nodes[index].take()?;
        self.free.push(index);
        Some(node.key)
    }
}

#[derive(Default)]
struct Inner {
    table: HashMap<CacheKey, CachedFile>,
    lru: LruList,
}

/// Bounded on-disk blob cache with hard-link materialization
pub struct FileCache {
    inner: Mutex<Inner>,
    cache_dir: PathBuf,
    hard_limit: u64,
    soft_limit: u64,
    total_size: AtomicU64,
    unique_counter: AtomicU64,
    purged_entries: AtomicU64,
}

impl FileCache {
    /// Create the cache directory together with its 256 shard
    /// subdirectories
    pub fn new(cache_dir: impl Into<PathBuf>, limit_bytes: u64) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        for shard in 0..DIR_SHARDS {
            fs::create_dir_all(cache_dir.join(format!("{shard:X}")))?;
        }
        debug!("Initialized file cache at {cache_dir:?}, limit {limit_bytes} bytes");
        Ok(Self {
            inner: Mutex::new(Inner::default()),
            cache_dir,
            hard_limit: limit_bytes,
            soft_limit: limit_bytes * 80 / 100,
            total_size: AtomicU64::new(0),
            unique_counter: AtomicU64::new(0),
            purged_entries: AtomicU64::new(0),
        })
    }

    /// Hard-link a cached blob to `dest`, promoting it to most recently
    /// used. Returns false when the blob is absent or the filesystem
    /// refused the link.
    pub fn materialize(&self, dest: &Path, digest: ContentDigest, extra: &str) -> bool {
        let Some(key) = Self::key_for(dest, digest, extra) else {
            return false;
        };
        let path_in_cache = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.table.get(&key) else {
                return false;
            };
            let node = entry.node;
            let path = entry.path_in_cache.clone();
            inner.lru.promote(node);
            path
        };
        if let Some(parent) = dest.parent() {
            if fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        // The entry may be evicted between the lookup and the link; the
        // failed link then reads as a miss.
        fs::hard_link(&path_in_cache, dest).is_ok()
    }

    /// Hard-link `src` into the cache under `(basename(src), digest,
    /// extra)`. Returns true when a new entry was inserted, false when the
    /// key was already present (the extra link is removed again). Evicts
    /// down to the hard limit afterwards.
    pub fn store(&self, src: &Path, digest: ContentDigest, extra: &str, size: u64) -> Result<bool> {
        let key =
            Self::key_for(src, digest, extra).ok_or_else(|| Error::NoFileName(src.to_owned()))?;
        let unique = self.unique_counter.fetch_add(1, Ordering::Relaxed);
        let path_in_cache = self
            .cache_dir
            .join(format!("{:X}", unique % DIR_SHARDS))
            .join(format!("{}.{unique:X}", key.name));
        fs::hard_link(src, &path_in_cache)?;

        let inserted = {
            let mut inner = self.inner.lock();
            if inner.table.contains_key(&key) {
                false
            } else {
                let node = inner.lru.push_front(key.clone());
                inner.table.insert(
                    key,
                    CachedFile {
                        path_in_cache: path_in_cache.clone(),
                        size,
                        node,
                    },
                );
                self.total_size.fetch_add(size, Ordering::Relaxed);
                true
            }
        };
        if !inserted {
            let _ = fs::remove_file(&path_in_cache);
        }
        self.purge_till(self.hard_limit);
        Ok(inserted)
    }

    /// Evict LRU-tail entries until the cache fits the soft limit
    pub fn purge_to_soft_limit(&self) {
        self.purge_till(self.soft_limit);
    }

    /// Number of cached entries
    pub fn entry_count(&self) -> u64 {
        self.inner.lock().table.len() as u64
    }

    /// Bytes currently accounted on disk
    pub fn bytes_on_disk(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Entries evicted since startup
    pub fn purged_entries(&self) -> u64 {
        self.purged_entries.load(Ordering::Relaxed)
    }

    fn key_for(path: &Path, digest: ContentDigest, extra: &str) -> Option<CacheKey> {
        let name = path.file_name()?.to_str()?;
        Some(CacheKey {
            name: name.to_string(),
            digest,
            extra: extra.to_string(),
        })
    }

    fn purge_till(&self, limit: u64) {
        while self.total_size.load(Ordering::Relaxed) > limit {
            let victim = {
                let mut inner = self.inner.lock();
                match inner.lru.pop_back() {
                    Some(key) => inner.table.remove(&key),
                    None => None,
                }
            };
            let Some(entry) = victim else {
                break;
            };
            // Unlink happens after the lock is released.
            if let Err(e) = fs::remove_file(&entry.path_in_cache) {
                warn!("Failed to remove evicted {:?}: {e}", entry.path_in_cache);
            }
            self.total_size.fetch_sub(entry.size, Ordering::Relaxed);
            self.purged_entries.fetch_add(1, Ordering::Relaxed);
        }
    }
}
