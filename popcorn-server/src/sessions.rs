//! Compilation sessions
//!
//! A session is the server-side lifetime of one remote compilation. It owns
//! a working directory under `sessions/<id>`, the table of required files,
//! and the compilation gate: an atomic countdown of the files still owed by
//! the client. The task that resolves the last owed file starts the
//! compiler; CompileSource merely awaits the latch, which is how compiler
//! startup overlaps the tail of the uploads.

use parking_lot::{Mutex, RwLock};
use popcorn_cache::ClientEntry;
use popcorn_protocol::{ContentDigest, FileMeta};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use tokio::sync::watch;

/// One file the translation unit needs, as tracked by a session
#[derive(Debug)]
pub struct RequiredFile {
    /// Absolute path on the client machine
    pub client_path: String,
    /// Client-observed mtime in nanoseconds
    pub mtime_ns: i64,
    /// Client-declared size in bytes
    pub size: i64,
    /// Materialization path relative to the session directory
    pub relative_path: PathBuf,
    /// Materialization path in absolute form
    pub absolute_path: PathBuf,
    digest: Mutex<ContentDigest>,
    system_hit: AtomicBool,
    resolved: AtomicBool,
}

impl RequiredFile {
    /// Track one file from its client-supplied metadata
    pub fn new(
        meta: &FileMeta,
        relative_path: PathBuf,
        absolute_path: PathBuf,
        digest: ContentDigest,
        system_hit: bool,
        resolved: bool,
    ) -> Self {
        Self {
            client_path: meta.path.as_str().to_string(),
            mtime_ns: meta.mtime_ns,
            size: meta.size,
            relative_path,
            absolute_path,
            digest: Mutex::new(digest),
            system_hit: AtomicBool::new(system_hit),
            resolved: AtomicBool::new(resolved),
        }
    }

    /// The resolved content digest, or the unknown sentinel
    pub fn digest(&self) -> ContentDigest {
        *self.digest.lock()
    }

    /// Record the digest learned from the client
    pub fn set_digest(&self, digest: ContentDigest) {
        *self.digest.lock() = digest;
    }

    /// True when the file is served from the server's own filesystem
    pub fn is_system_hit(&self) -> bool {
        self.system_hit.load(Ordering::Relaxed)
    }

    /// Mark the file as served from the server's own filesystem
    pub fn mark_system_hit(&self) {
        self.system_hit.store(true, Ordering::Relaxed);
    }

    /// True once the file no longer blocks compilation
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    fn mark_resolved(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }

    /// Basename used in cache keys
    pub fn basename(&self) -> String {
        self.relative_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// What a gate decrement meant for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileResolution {
    /// The file was already resolved; nothing changed
    AlreadyResolved,
    /// The file is resolved, other files are still owed
    Resolved,
    /// The file was the last one owed: the compiler may run now
    LastResolved,
}

/// Captured result of running (or skipping) the compiler
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    /// Compiler process exit code; 0 for object-cache hits
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: Vec<u8>,
    /// Captured standard error
    pub stderr: Vec<u8>,
    /// Absolute path of the produced object, present on success
    pub object: Option<PathBuf>,
}

/// Either an outcome or the reason compilation could not be attempted
pub type CompileResult = std::result::Result<CompileOutcome, String>;

/// Server-side state of one remote compilation
#[derive(Debug)]
pub struct Session {
    /// Monotonically increasing session id
    pub id: u64,
    /// Registry entry of the owning client
    pub client: Arc<ClientEntry>,
    /// Client account name, for path neutralization
    pub user_name: String,
    /// Compiler executable name
    pub compiler: String,
    /// Compiler argv as sent by the client
    pub compiler_args: Vec<String>,
    /// Session working directory, exclusively owned
    pub working_dir: PathBuf,
    /// Translated session-relative source path
    pub source_rel: PathBuf,
    /// Translated session-relative object path
    pub object_rel: PathBuf,
    /// Whether the compiled-object cache applies
    pub use_object_cache: bool,
    /// Required-file table, indexed by wire file index
    pub files: Vec<RequiredFile>,
    gate: AtomicI32,
    latch: watch::Sender<bool>,
    outcome: Mutex<Option<CompileResult>>,
}

impl Session {
    /// Assemble a session whose gate starts at `pending_files`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        client: Arc<ClientEntry>,
        user_name: String,
        compiler: String,
        compiler_args: Vec<String>,
        working_dir: PathBuf,
        source_rel: PathBuf,
        use_object_cache: bool,
        files: Vec<RequiredFile>,
        pending_files: i32,
    ) -> Self {
        let object_rel = PathBuf::from(format!("{}.o", source_rel.display()));
        let (latch, _) = watch::channel(false);
        Self {
            id,
            client,
            user_name,
            compiler,
            compiler_args,
            working_dir,
            source_rel,
            object_rel,
            use_object_cache,
            files,
            gate: AtomicI32::new(pending_files),
            latch,
            outcome: Mutex::new(None),
        }
    }

    /// Resolve one file and decrement the gate at most once per file
    pub fn resolve_file(&self, index: usize) -> FileResolution {
        if !self.files[index].mark_resolved() {
            return FileResolution::AlreadyResolved;
        }
        if self.gate.fetch_sub(1, Ordering::AcqRel) == 1 {
            FileResolution::LastResolved
        } else {
            FileResolution::Resolved
        }
    }

    /// Absolute object path inside the working directory
    pub fn object_abs(&self) -> PathBuf {
        self.working_dir.join(&self.object_rel)
    }

    /// Publish the compile result and release every latch waiter
    pub fn store_outcome(&self, result: CompileResult) {
        *self.outcome.lock() = Some(result);
        let _ = self.latch.send(true);
    }

    /// Release latch waiters with a failure unless a real outcome exists.
    /// Called on teardown so no CompileSource waiter is left hanging.
    pub fn abort(&self, reason: &str) {
        {
            let mut outcome = self.outcome.lock();
            if outcome.is_none() {
                *outcome = Some(Err(reason.to_string()));
            }
        }
        let _ = self.latch.send(true);
    }

    /// The published compile result, if any
    pub fn outcome(&self) -> Option<CompileResult> {
        self.outcome.lock().clone()
    }

    /// Latch receiver for CompileSource waiters
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.latch.subscribe()
    }
}

/// Table of open sessions
#[derive(Debug, Default)]
pub struct SessionStore {
    table: RwLock<HashMap<u64, Arc<Session>>>,
    counter: AtomicU64,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next session id
    pub fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register an open session
    pub fn insert(&self, session: Arc<Session>) {
        self.table.write().insert(session.id, session);
    }

    /// Look up an open session
    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.table.read().get(&id).cloned()
    }

    /// Remove a session, returning it for teardown
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.table.write().remove(&id)
    }

    /// Number of open sessions
    pub fn len(&self) -> u64 {
        self.table.read().len() as u64
    }

    /// True when no session is open
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

/// Working directory of a session id under `sessions_dir`
pub fn session_dir(sessions_dir: &Path, id: u64) -> PathBuf {
    sessions_dir.join(id.to_string())
}
