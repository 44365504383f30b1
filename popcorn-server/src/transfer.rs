//! Server side of the TransferFile stream
//!
//! Per stream, the state machine of one required file: learn the digest,
//! satisfy it from the system-header cache or the source cache if possible,
//! otherwise win (or force) the upload claim and receive the body. Every
//! exit path releases the claim; a drop guard covers disconnects and
//! errors in between. A failed transfer ends the whole session: the client
//! is falling back to a local build anyway.

use crate::error::{Error, Result};
use crate::service::{ServerState, finish_file, teardown_session};
use crate::sessions::Session;
use popcorn_cache::TransferRegistry;
use popcorn_protocol::{ContentDigest, TransferReply, TransferRequest, read_frame, write_frame};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Upload claim that releases itself when the holder unwinds
struct UploadClaim<'a> {
    transfers: &'a TransferRegistry,
    path: &'a str,
    digest: ContentDigest,
    armed: bool,
}

impl<'a> UploadClaim<'a> {
    fn new(transfers: &'a TransferRegistry, path: &'a str, digest: ContentDigest) -> Self {
        Self {
            transfers,
            path,
            digest,
            armed: true,
        }
    }

    fn release(mut self) {
        self.armed = false;
        self.transfers.finish(self.path, self.digest);
    }
}

impl Drop for UploadClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.transfers.finish(self.path, self.digest);
        }
    }
}

async fn refuse(socket: &mut TcpStream, reason: String) -> Result<()> {
    debug!("TransferFile refused: {reason}");
    write_frame(
        socket,
        &TransferReply::Refused {
            reason: reason.into(),
        },
    )
    .await?;
    Ok(())
}

/// Handle one TransferFile connection
pub async fn handle_transfer_file(state: &Arc<ServerState>, socket: &mut TcpStream) -> Result<()> {
    let request: TransferRequest = read_frame(socket).await?;
    let TransferRequest::Header {
        session_id,
        file_index,
        sha256,
    } = request
    else {
        return refuse(socket, "Expected a transfer header".to_string()).await;
    };

    let Some(session) = state.sessions.get(session_id) else {
        return refuse(socket, format!("Unknown session {session_id}")).await;
    };

    // Anything that keeps this file from being resolved dooms the whole
    // compilation; the session is useless from here on.
    match resolve_file(state, socket, &session, file_index, sha256).await {
        Ok(FileOutcome::Resolved) => Ok(()),
        Ok(FileOutcome::Failed) => {
            teardown_session(state, session_id).await;
            Ok(())
        }
        Err(e) => {
            teardown_session(state, session_id).await;
            Err(e)
        }
    }
}

enum FileOutcome {
    Resolved,
    Failed,
}

async fn resolve_file(
    state: &Arc<ServerState>,
    socket: &mut TcpStream,
    session: &Arc<Session>,
    file_index: u32,
    sha256: ContentDigest,
) -> Result<FileOutcome> {
    let index = file_index as usize;
    if index >= session.files.len() {
        refuse(socket, format!("File index {file_index} out of range")).await?;
        return Ok(FileOutcome::Failed);
    }

    // The header may arrive without a digest; ask for one until it shows.
    let mut digest = sha256;
    while digest.is_unknown() {
        write_frame(socket, &TransferReply::Sha256Required).await?;
        let next: TransferRequest = read_frame(socket).await?;
        let TransferRequest::Header { sha256, .. } = next else {
            refuse(socket, "Expected a header carrying the digest".to_string()).await?;
            return Ok(FileOutcome::Failed);
        };
        digest = sha256;
    }

    let file = &session.files[index];
    // The client is authoritative for its own file: a digest it just
    // computed overwrites whatever identity was cached before.
    session
        .client
        .files
        .set(&file.client_path, file.mtime_ns, file.size, digest);
    file.set_digest(digest);

    if file.is_resolved() {
        write_frame(socket, &TransferReply::Done).await?;
        return Ok(FileOutcome::Resolved);
    }

    if state.system_headers.digest_for(&file.client_path).await == Some(digest) {
        file.mark_system_hit();
        finish_file(state, session, index);
        write_frame(socket, &TransferReply::Done).await?;
        return Ok(FileOutcome::Resolved);
    }

    if state.src_cache.materialize(&file.absolute_path, digest, "") {
        finish_file(state, session, index);
        write_frame(socket, &TransferReply::Done).await?;
        return Ok(FileOutcome::Resolved);
    }

    // Someone may be uploading this very blob right now. Wait for the
    // cache to fill, claiming the upload ourselves if the wait runs out.
    let deadline = Instant::now() + state.settings.cache_wait();
    let mut claimed = state.transfers.start(&file.client_path, digest);
    while !claimed {
        tokio::time::sleep(state.settings.cache_poll()).await;
        if state.src_cache.materialize(&file.absolute_path, digest, "") {
            finish_file(state, session, index);
            write_frame(socket, &TransferReply::Done).await?;
            return Ok(FileOutcome::Resolved);
        }
        if Instant::now() >= deadline {
            state.transfers.force_start(&file.client_path, digest);
            claimed = true;
        } else {
            claimed = state.transfers.start(&file.client_path, digest);
        }
    }

    let claim = UploadClaim::new(&state.transfers, &file.client_path, digest);
    write_frame(socket, &TransferReply::FullCopyRequired).await?;

    let (tmp_path, written) = receive_body(socket, session, index).await?;
    if written != file.size as u64 {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        refuse(
            socket,
            format!(
                "Received {written} bytes for {} but the client declared {}",
                file.client_path, file.size
            ),
        )
        .await?;
        return Ok(FileOutcome::Failed);
    }
    tokio::fs::rename(&tmp_path, &file.absolute_path).await?;

    if let Err(e) = state
        .src_cache
        .store(&file.absolute_path, digest, "", written)
    {
        warn!("Can't cache uploaded {}: {e}", file.client_path);
    }
    claim.release();
    state.stats.transferred_files.increment();

    finish_file(state, session, index);
    write_frame(socket, &TransferReply::Done).await?;
    Ok(FileOutcome::Resolved)
}

/// Receive body chunks into a temp file next to the destination. Returns
/// the temp path and the byte count actually written; the caller verifies
/// the count and renames the file into place.
async fn receive_body(
    socket: &mut TcpStream,
    session: &Session,
    index: usize,
) -> Result<(PathBuf, u64)> {
    let file = &session.files[index];
    if let Some(parent) = file.absolute_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = PathBuf::from(format!("{}.part", file.absolute_path.display()));
    let mut output = tokio::fs::File::create(&tmp_path).await?;

    let mut written: u64 = 0;
    let result = loop {
        let message: TransferRequest = match read_frame(socket).await {
            Ok(message) => message,
            Err(e) => break Err(Error::Protocol(e)),
        };
        let TransferRequest::Chunk { data } = message else {
            break Err(Error::Violation(
                "Expected a body chunk during upload".to_string(),
            ));
        };
        if data.is_empty() {
            break Ok(());
        }
        if let Err(e) = output.write_all(&data.0).await {
            break Err(Error::Io(e));
        }
        written += data.0.len() as u64;
    };

    if let Err(e) = result {
        drop(output);
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    output.flush().await?;
    drop(output);
    Ok((tmp_path, written))
}
