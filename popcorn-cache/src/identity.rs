//! Per-client file-identity caches and the client registry
//!
//! A client proves nothing about file content when it opens a session; it
//! only reports `(path, mtime, size)` triples. The identity cache remembers
//! which digest such a triple resolved to last time, so unchanged files skip
//! re-hashing and re-transfer. Entries whose recorded `(mtime, size)` pair
//! no longer matches the client's report read as unknown.

use parking_lot::{Mutex, RwLock};
use popcorn_protocol::ContentDigest;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

/// How long a client may stay idle before the registry may drop it
const CLIENT_IDLE_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum spacing between purge walks over the registry
const PURGE_WALK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Stored identity of one client file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    digest: ContentDigest,
    mtime_ns: i64,
    size: i64,
}

/// `path → (digest, mtime, size)` map with staleness checks
#[derive(Debug, Default)]
pub struct FileIdentityCache {
    table: RwLock<HashMap<String, FileIdentity>>,
}

impl FileIdentityCache {
    /// Look up the digest recorded for `path`, provided the observed
    /// `(mtime, size)` pair still matches
    pub fn get(&self, path: &str, mtime_ns: i64, size: i64) -> Option<ContentDigest> {
        let table = self.table.read();
        let identity = table.get(path)?;
        if identity.mtime_ns != mtime_ns || identity.size != size {
            return None;
        }
        Some(identity.digest)
    }

    /// Record the digest for `path` as observed at `(mtime, size)`.
    /// Overwrites unconditionally: the client is authoritative for the
    /// identity of its own files.
    pub fn set(&self, path: &str, mtime_ns: i64, size: i64, digest: ContentDigest) {
        self.table.write().insert(
            path.to_string(),
            FileIdentity {
                digest,
                mtime_ns,
                size,
            },
        );
    }

    /// Number of recorded identities
    pub fn len(&self) -> u64 {
        self.table.read().len() as u64
    }

    /// True when no identities are recorded
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

/// One known client: its identity cache plus an activity timestamp
#[derive(Debug, Default)]
pub struct ClientEntry {
    /// The client's file-identity cache
    pub files: FileIdentityCache,
    last_seen_ns: AtomicI64,
}

impl ClientEntry {
    fn touch(&self, now_ns: i64) {
        self.last_seen_ns.store(now_ns, Ordering::Relaxed);
    }
}

/// Registry of every client the server has seen recently
#[derive(Debug, Default)]
pub struct ClientRegistry {
    table: RwLock<HashMap<ContentDigest, Arc<ClientEntry>>>,
    last_purge_walk_ns: Mutex<i64>,
}

fn unix_nanos(now: SystemTime) -> i64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the entry for `client_id`, creating it on first reference,
    /// and refresh its activity timestamp
    pub fn get_or_insert(&self, client_id: ContentDigest) -> Arc<ClientEntry> {
        let existing = self.table.read().get(&client_id).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut table = self.table.write();
                // Double-checked: another session may have inserted it
                // between the read and the write lock.
                table.entry(client_id).or_default().clone()
            }
        };
        entry.touch(unix_nanos(SystemTime::now()));
        entry
    }

    /// Number of known clients
    pub fn len(&self) -> u64 {
        self.table.read().len() as u64
    }

    /// True when no clients are known
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Identity-cache size of an arbitrary client, as a health sample
    pub fn sampled_identity_entries(&self) -> u64 {
        self.table
            .read()
            .values()
            .next()
            .map_or(0, |entry| entry.files.len())
    }

    /// Walk the registry at most once per hour and evict a single client
    /// idle for over 24 hours. One victim per walk bounds lock-hold time.
    pub fn purge_outdated(&self) {
        self.purge_outdated_at(SystemTime::now());
    }

    fn purge_outdated_at(&self, now: SystemTime) {
        let now_ns = unix_nanos(now);
        {
            let last_walk = self.last_purge_walk_ns.lock();
            if now_ns - *last_walk < PURGE_WALK_INTERVAL.as_nanos() as i64 {
                return;
            }
        }

        let threshold_ns = CLIENT_IDLE_THRESHOLD.as_nanos() as i64;
        let victim = {
            let table = self.table.read();
            table
                .iter()
                .find(|(_, entry)| now_ns - entry.last_seen_ns.load(Ordering::Relaxed) > threshold_ns)
                .map(|(id, _)| *id)
        };

        match victim {
            Some(id) => {
                self.table.write().remove(&id);
                info!("Evicted idle client {id}");
            }
            None => {
                // Nothing outdated: the walk is complete, schedule the next
                // one an hour out.
                *self.last_purge_walk_ns.lock() = now_ns;
            }
        }
    }
}
