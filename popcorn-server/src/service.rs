//! RPC facade of the compilation server
//!
//! Every accepted connection carries exactly one RPC, announced by the
//! handshake. Handlers run as independent tasks; shared state lives behind
//! [`ServerState`] and its internal locks.

use crate::compile::run_compile_task;
use crate::error::Result;
use crate::paths::{session_relative, translate};
use crate::sessions::{FileResolution, RequiredFile, Session, SessionStore, session_dir};
use crate::settings::ServerSettings;
use crate::stats::{RpcStats, ServerStats};
use crate::transfer::handle_transfer_file;
use popcorn_cache::{
    ClientRegistry, FileCache, SystemHeaderCache, TransferRegistry,
};
use popcorn_protocol::{
    CloseSessionReply, CloseSessionRequest, CompileReply, CompileSourceRequest, ContentDigest,
    FileAction, FileStatus, Method, StartSessionReply, StartSessionRequest, StatusReply,
    StatusRequest, WireBytes, read_frame, read_hello, write_frame,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Everything the RPC handlers share
pub struct ServerState {
    /// Parsed server flags
    pub settings: ServerSettings,
    /// Open sessions
    pub sessions: SessionStore,
    /// Known clients and their identity caches
    pub clients: ClientRegistry,
    /// Digests of headers on the server's own filesystem
    pub system_headers: SystemHeaderCache,
    /// Content-addressed source/header cache
    pub src_cache: FileCache,
    /// Content-addressed compiled-object cache
    pub obj_cache: FileCache,
    /// In-flight upload claims
    pub transfers: TransferRegistry,
    /// Rolling metrics
    pub stats: ServerStats,
    /// Process start, for uptime reporting
    pub start_time: Instant,
}

impl ServerState {
    /// Build the shared state, creating both cache directories
    pub fn new(settings: ServerSettings) -> Result<Self> {
        let src_cache = FileCache::new(settings.src_cache_dir(), settings.src_cache_limit)?;
        let obj_cache = FileCache::new(settings.obj_cache_dir(), settings.obj_cache_limit)?;
        let transfers = TransferRegistry::with_stale_after(settings.transfer_stale());
        Ok(Self {
            settings,
            sessions: SessionStore::new(),
            clients: ClientRegistry::new(),
            system_headers: SystemHeaderCache::new(),
            src_cache,
            obj_cache,
            transfers,
            stats: ServerStats::default(),
            start_time: Instant::now(),
        })
    }
}

/// Accept connections until shutdown, then drain the in-flight ones
pub async fn serve(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Accepted connection from {peer}");
                    let state = Arc::clone(&state);
                    connections.spawn(handle_connection(state, socket));
                }
                Err(e) => warn!("Accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
        while connections.try_join_next().is_some() {}
    }
    drop(listener);
    if !connections.is_empty() {
        info!("Draining {} in-flight connections", connections.len());
    }
    while connections.join_next().await.is_some() {}
}

async fn observed<F>(stats: &RpcStats, call: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let observer = stats.start_call();
    match call.await {
        Ok(()) => {
            observer.finish();
            Ok(())
        }
        Err(e) => {
            observer.finish_with_error();
            Err(e)
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, mut socket: TcpStream) {
    let hello = match read_hello(&mut socket).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!("Dropped connection before handshake: {e}");
            return;
        }
    };
    let stats = &state.stats;
    let result = match hello.method {
        Method::StartSession => {
            observed(&stats.start_session, handle_start_session(&state, &mut socket)).await
        }
        Method::TransferFile => {
            observed(&stats.transfer_file, handle_transfer_file(&state, &mut socket)).await
        }
        Method::CompileSource => {
            observed(&stats.compile_source, handle_compile_source(&state, &mut socket)).await
        }
        Method::CloseSession => {
            observed(&stats.close_session, handle_close_session(&state, &mut socket)).await
        }
        Method::Status => observed(&stats.status, handle_status(&state, &mut socket)).await,
    };
    if let Err(e) = result {
        debug!("{:?} call ended with error: {e}", hello.method);
    }
}

/// Resolve one file of a session; the caller that resolves the last one
/// starts the compile task
pub fn finish_file(state: &Arc<ServerState>, session: &Arc<Session>, index: usize) {
    if session.resolve_file(index) == FileResolution::LastResolved {
        spawn_compile(state, session);
    }
}

fn spawn_compile(state: &Arc<ServerState>, session: &Arc<Session>) {
    debug!("Session {}: all inputs resolved, starting compiler", session.id);
    tokio::spawn(run_compile_task(Arc::clone(state), Arc::clone(session)));
}

async fn handle_start_session(state: &Arc<ServerState>, socket: &mut TcpStream) -> Result<()> {
    let request: StartSessionRequest = read_frame(socket).await?;
    let reply = open_session(state, request).await;
    write_frame(socket, &reply).await?;
    Ok(())
}

async fn open_session(state: &Arc<ServerState>, request: StartSessionRequest) -> StartSessionReply {
    let client = state.clients.get_or_insert(request.client_id);
    let id = state.sessions.next_id();
    let working_dir = session_dir(&state.settings.sessions_dir(), id);
    if let Err(e) = tokio::fs::create_dir_all(&working_dir).await {
        warn!("Session {id}: can't create working directory: {e}");
        return StartSessionReply::Refused {
            reason: format!("Can't create session directory: {e}").into(),
        };
    }

    let user_name = request.user_name.as_str();
    let neutralize = request.use_object_cache;
    let mut files = Vec::with_capacity(request.required_files.len());
    let mut actions = Vec::new();

    for (index, meta) in request.required_files.iter().enumerate() {
        let translated = translate(meta.path.as_str(), user_name, neutralize);
        let relative = session_relative(&translated);
        let absolute = working_dir.join(&relative);

        let known = client
            .files
            .get(meta.path.as_str(), meta.mtime_ns, meta.size);
        let mut digest = ContentDigest::UNKNOWN;
        let mut system_hit = false;
        let mut resolved = false;
        match known {
            None => actions.push(FileStatus {
                index: index as u32,
                action: FileAction::Sha256Required,
            }),
            Some(cached) => {
                digest = cached;
                if state.system_headers.digest_for(meta.path.as_str()).await == Some(cached) {
                    system_hit = true;
                    resolved = true;
                } else if state.src_cache.materialize(&absolute, cached, "") {
                    resolved = true;
                } else {
                    actions.push(FileStatus {
                        index: index as u32,
                        action: FileAction::FullCopyRequired,
                    });
                }
            }
        }
        files.push(RequiredFile::new(
            meta, relative, absolute, digest, system_hit, resolved,
        ));
    }

    let source_rel = session_relative(&translate(
        request.source_path.as_str(),
        user_name,
        neutralize,
    ));
    let pending = actions.len() as i32;
    let session = Arc::new(Session::new(
        id,
        client,
        user_name.to_string(),
        request.compiler.as_str().to_string(),
        request
            .compiler_args
            .iter()
            .map(|arg| arg.as_str().to_string())
            .collect(),
        working_dir,
        source_rel,
        request.use_object_cache,
        files,
        pending,
    ));
    state.sessions.insert(Arc::clone(&session));
    info!(
        "Session {id}: opened for {user_name}, {} files, {pending} pending",
        session.files.len()
    );
    if pending == 0 {
        spawn_compile(state, &session);
    }
    StartSessionReply::Opened {
        session_id: id,
        required_files: actions,
    }
}

async fn handle_compile_source(state: &Arc<ServerState>, socket: &mut TcpStream) -> Result<()> {
    let request: CompileSourceRequest = read_frame(socket).await?;
    let Some(session) = state.sessions.get(request.session_id) else {
        write_frame(
            socket,
            &CompileReply::Refused {
                reason: format!("Unknown session {}", request.session_id).into(),
            },
        )
        .await?;
        return Ok(());
    };

    // The compiler was started by whichever upload resolved the last file;
    // here we only await the latch.
    let mut latch = session.subscribe();
    while !*latch.borrow_and_update() {
        if latch.changed().await.is_err() {
            break;
        }
    }

    let result = stream_outcome(socket, &session).await;
    // A broken reply stream means the client is gone; its session is
    // useless either way.
    if request.close_after_build || result.is_err() {
        teardown_session(state, request.session_id).await;
    }
    result
}

async fn stream_outcome(socket: &mut TcpStream, session: &Session) -> Result<()> {
    let outcome = match session.outcome() {
        Some(Ok(outcome)) => outcome,
        Some(Err(reason)) => {
            write_frame(
                socket,
                &CompileReply::Refused {
                    reason: reason.into(),
                },
            )
            .await?;
            return Ok(());
        }
        None => {
            write_frame(
                socket,
                &CompileReply::Refused {
                    reason: "Session was closed before compilation finished".into(),
                },
            )
            .await?;
            return Ok(());
        }
    };

    if let Some(object) = &outcome.object {
        let mut file = tokio::fs::File::open(object).await?;
        let mut buf = vec![0u8; popcorn_protocol::CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            write_frame(
                socket,
                &CompileReply::Chunk {
                    data: WireBytes(buf[..read].to_vec()),
                },
            )
            .await?;
        }
    }
    write_frame(
        socket,
        &CompileReply::Epilogue {
            exit_code: outcome.exit_code,
            stdout: WireBytes(outcome.stdout),
            stderr: WireBytes(outcome.stderr),
        },
    )
    .await?;
    Ok(())
}

async fn handle_close_session(state: &Arc<ServerState>, socket: &mut TcpStream) -> Result<()> {
    let request: CloseSessionRequest = read_frame(socket).await?;
    let reply = if state.sessions.get(request.session_id).is_some() {
        teardown_session(state, request.session_id).await;
        CloseSessionReply::Closed
    } else {
        CloseSessionReply::Refused {
            reason: format!("Unknown session {}", request.session_id).into(),
        }
    };
    write_frame(socket, &reply).await?;
    Ok(())
}

async fn handle_status(state: &Arc<ServerState>, socket: &mut TcpStream) -> Result<()> {
    let _request: StatusRequest = read_frame(socket).await?;
    let reply = StatusReply {
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_sessions: state.sessions.len(),
        known_clients: state.clients.len(),
        system_headers: state.system_headers.len(),
        src_cache_files: state.src_cache.entry_count(),
        src_cache_bytes: state.src_cache.bytes_on_disk(),
        obj_cache_files: state.obj_cache.entry_count(),
        obj_cache_bytes: state.obj_cache.bytes_on_disk(),
    };
    write_frame(socket, &reply).await?;
    Ok(())
}

/// Remove a session and delete its working directory
pub async fn teardown_session(state: &Arc<ServerState>, session_id: u64) {
    if let Some(session) = state.sessions.remove(session_id) {
        debug!("Session {session_id}: tearing down");
        session.abort("Session was closed");
        if let Err(e) = tokio::fs::remove_dir_all(&session.working_dir).await {
            warn!(
                "Session {session_id}: can't remove {:?}: {e}",
                session.working_dir
            );
        }
    }
}
