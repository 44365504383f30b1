//! Remote compilation driver
//!
//! Drives the four-step session protocol against one server: StartSession
//! with the full file inventory, concurrent TransferFile streams for
//! whatever the server asked for (at most six at a time, to bound sockets
//! and disk pressure), CompileSource with close-after-build, and an
//! explicit CloseSession only when the build never ran. The produced
//! object lands in a temp file and is renamed over the target only once
//! the epilogue reports success.

use crate::compiler::LocalCompiler;
use crate::error::{Error, Result};
use crate::identity;
use crate::select::choose_server;
use crate::settings::ClientSettings;
use popcorn_protocol::{
    CHUNK_SIZE, CloseSessionReply, CloseSessionRequest, CompileReply, CompileSourceRequest,
    ContentDigest, FileMeta, FileStatus, Method, RPC_DEADLINE, StartSessionReply,
    StartSessionRequest, TransferReply, TransferRequest, WireBytes, connect, read_frame,
    write_frame,
};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info};

/// Upload parallelism per session
const MAX_CONCURRENT_UPLOADS: usize = 6;

async fn with_deadline<F, T>(call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(RPC_DEADLINE, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded(RPC_DEADLINE.as_secs())),
    }
}

async fn file_meta(path: &str) -> Result<FileMeta> {
    let meta = tokio::fs::metadata(path).await?;
    let mtime_ns = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    Ok(FileMeta {
        path: path.into(),
        mtime_ns,
        size: meta.len() as i64,
    })
}

/// Compile the translation unit remotely. Returns the compiler's exit
/// code and captured output; any [`Error`] means the caller should fall
/// back to a local build.
pub async fn compile_remotely(
    settings: &ClientSettings,
    local: &mut LocalCompiler,
) -> Result<(i32, Vec<u8>, Vec<u8>)> {
    let inputs = local.enumerate_inputs().await?;
    let Some(address) = choose_server(&settings.servers, &local.in_file) else {
        return Err(Error::NoAvailableHosts);
    };

    let mut required_files = Vec::with_capacity(inputs.len());
    for input in &inputs {
        required_files.push(file_meta(input).await?);
    }

    let session = RemoteSession::open(
        address,
        local,
        required_files,
        settings.use_object_cache,
    )
    .await?;
    session.run(local).await
}

struct RemoteSession {
    address: String,
    session_id: u64,
    pending: Vec<(u32, String)>,
}

impl RemoteSession {
    async fn open(
        address: &str,
        local: &mut LocalCompiler,
        required_files: Vec<FileMeta>,
        use_object_cache: bool,
    ) -> Result<Self> {
        let request = StartSessionRequest {
            client_id: identity::client_id(),
            user_name: identity::user_name().into(),
            compiler: local.name.clone().into(),
            compiler_args: local
                .make_remote_args(&[])
                .into_iter()
                .map(Into::into)
                .collect(),
            source_path: local.in_file.clone().into(),
            required_files: required_files.clone(),
            use_object_cache,
        };

        let (session_id, statuses) = with_deadline(async {
            let mut stream = connect(address, Method::StartSession).await?;
            write_frame(&mut stream, &request).await?;
            match read_frame::<_, StartSessionReply>(&mut stream).await? {
                StartSessionReply::Opened {
                    session_id,
                    required_files,
                } => Ok((session_id, required_files)),
                StartSessionReply::Refused { reason } => {
                    Err(Error::Refused(reason.as_str().to_string()))
                }
            }
        })
        .await?;

        debug!(
            "Session {session_id} opened on {address}: {} of {} files wanted",
            statuses.len(),
            required_files.len()
        );
        let pending = statuses
            .iter()
            .map(|FileStatus { index, .. }| {
                (
                    *index,
                    required_files
                        .get(*index as usize)
                        .map(|meta| meta.path.as_str().to_string())
                        .unwrap_or_default(),
                )
            })
            .collect();
        Ok(Self {
            address: address.to_string(),
            session_id,
            pending,
        })
    }

    async fn run(self, local: &LocalCompiler) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        match self.upload_and_compile(local).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.close_best_effort().await;
                Err(e)
            }
        }
    }

    async fn upload_and_compile(&self, local: &LocalCompiler) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS));
        let mut uploads: JoinSet<Result<()>> = JoinSet::new();
        for (index, path) in self.pending.clone() {
            let address = self.address.clone();
            let session_id = self.session_id;
            let limiter = Arc::clone(&limiter);
            uploads.spawn(async move {
                let _permit = limiter.acquire().await;
                with_deadline(upload_file(&address, session_id, index, &path)).await
            });
        }
        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::UnexpectedReply(format!("upload task died: {e}"))),
            }
        }

        with_deadline(self.compile_source(local)).await
    }

    async fn compile_source(&self, local: &LocalCompiler) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let mut stream = connect(&self.address, Method::CompileSource).await?;
        write_frame(
            &mut stream,
            &CompileSourceRequest {
                session_id: self.session_id,
                close_after_build: true,
            },
        )
        .await?;

        let tmp_path = format!("{}.tmp-{}", local.out_file, std::process::id());
        let mut object = tokio::fs::File::create(&tmp_path).await?;
        let mut object_bytes: u64 = 0;
        let outcome = loop {
            match read_frame::<_, CompileReply>(&mut stream).await {
                Ok(CompileReply::Chunk { data }) => {
                    object_bytes += data.0.len() as u64;
                    if let Err(e) = object.write_all(&data.0).await {
                        break Err(Error::Io(e));
                    }
                }
                Ok(CompileReply::Epilogue {
                    exit_code,
                    stdout,
                    stderr,
                }) => break Ok((exit_code, stdout.0, stderr.0)),
                Ok(CompileReply::Refused { reason }) => {
                    break Err(Error::Refused(reason.as_str().to_string()));
                }
                Err(e) => break Err(Error::Protocol(e)),
            }
        };
        object.flush().await?;
        drop(object);

        match outcome {
            Ok((exit_code, stdout, stderr)) => {
                if exit_code == 0 {
                    tokio::fs::rename(&tmp_path, &local.out_file).await?;
                    info!(
                        "Remote compilation produced {} ({object_bytes} bytes)",
                        local.out_file
                    );
                } else {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                }
                Ok((exit_code, stdout, stderr))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn close_best_effort(&self) {
        let result = with_deadline(async {
            let mut stream = connect(&self.address, Method::CloseSession).await?;
            write_frame(
                &mut stream,
                &CloseSessionRequest {
                    session_id: self.session_id,
                },
            )
            .await?;
            let _reply: CloseSessionReply = read_frame(&mut stream).await?;
            Ok(())
        })
        .await;
        if let Err(e) = result {
            debug!("CloseSession for {} failed: {e}", self.session_id);
        }
    }
}

/// Resolve one required file on its own TransferFile stream
async fn upload_file(address: &str, session_id: u64, file_index: u32, path: &str) -> Result<()> {
    let sha256 = ContentDigest::of_file(path).await?;
    let mut stream = connect(address, Method::TransferFile).await?;
    write_frame(
        &mut stream,
        &TransferRequest::Header {
            session_id,
            file_index,
            sha256,
        },
    )
    .await?;

    loop {
        match read_frame::<_, TransferReply>(&mut stream).await? {
            TransferReply::Done => return Ok(()),
            TransferReply::Sha256Required => {
                // The header already carried the digest; send it again for
                // a server that asked anyway.
                write_frame(
                    &mut stream,
                    &TransferRequest::Header {
                        session_id,
                        file_index,
                        sha256,
                    },
                )
                .await?;
            }
            TransferReply::FullCopyRequired => {
                send_body(&mut stream, path).await?;
            }
            TransferReply::Refused { reason } => {
                return Err(Error::Refused(reason.as_str().to_string()));
            }
        }
    }
}

async fn send_body(stream: &mut tokio::net::TcpStream, path: &str) -> Result<()> {
    debug!("Uploading {path}");
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        write_frame(
            stream,
            &TransferRequest::Chunk {
                data: WireBytes(buf[..read].to_vec()),
            },
        )
        .await?;
        if read == 0 {
            return Ok(());
        }
    }
}
