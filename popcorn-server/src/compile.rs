//! Compiler invocation and the object cache short-circuit

use crate::object_key::{ObjectKey, object_key};
use crate::paths::rewrite_include_dirs;
use crate::service::ServerState;
use crate::sessions::{CompileOutcome, CompileResult, Session};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Background task spawned when a session's gate reaches zero: runs the
/// compilation and releases the CompileSource latch
pub async fn run_compile_task(state: Arc<ServerState>, session: Arc<Session>) {
    let result = compile_session(&state, &session).await;
    session.store_outcome(result);
}

/// Final compiler argv: rewritten include dirs plus output and source
fn final_args(session: &Session) -> Vec<String> {
    let staged: Vec<String> = session
        .files
        .iter()
        .filter(|file| !file.is_system_hit())
        .map(|file| format!("/{}", file.relative_path.display()))
        .collect();
    let mut args = rewrite_include_dirs(
        &session.compiler_args,
        &session.user_name,
        session.use_object_cache,
        &staged,
    );
    args.push("-o".to_string());
    args.push(session.object_rel.to_string_lossy().into_owned());
    args.push(session.source_rel.to_string_lossy().into_owned());
    args
}

fn session_object_key(session: &Session, args: &[String]) -> ObjectKey {
    let dependencies: Vec<(String, popcorn_protocol::ContentDigest)> = session
        .files
        .iter()
        .map(|file| (file.basename(), file.digest()))
        .collect();
    object_key(&session.compiler, args, &dependencies)
}

async fn compile_session(state: &ServerState, session: &Session) -> CompileResult {
    let args = final_args(session);
    let key = session
        .use_object_cache
        .then(|| session_object_key(session, &args));

    let object_abs = session.object_abs();
    if let Some(key) = &key {
        if state.obj_cache.materialize(&object_abs, key.digest, &key.extra) {
            state.stats.object_cache_hits.increment();
            info!("Session {}: object cache hit", session.id);
            return Ok(CompileOutcome {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
                object: Some(object_abs),
            });
        }
    }

    debug!(
        "Session {}: running {} with {} args",
        session.id,
        session.compiler,
        args.len()
    );
    let output = Command::new(&session.compiler)
        .args(&args)
        .current_dir(&session.working_dir)
        .output()
        .await
        .map_err(|e| format!("Can't run compiler {}: {e}", session.compiler))?;

    let exit_code = output.status.code().unwrap_or(-1);
    if exit_code != 0 {
        debug!("Session {}: compiler exited with {exit_code}", session.id);
        return Ok(CompileOutcome {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            object: None,
        });
    }

    let object_size = tokio::fs::metadata(&object_abs)
        .await
        .map_err(|e| format!("Compiler exited 0 but produced no object: {e}"))?
        .len();

    if let Some(key) = &key {
        // Caching an object built with diagnostics would silently swallow
        // those diagnostics on every later hit.
        if output.stdout.is_empty() && output.stderr.is_empty() {
            match state.obj_cache.store(&object_abs, key.digest, &key.extra, object_size) {
                Ok(true) => debug!("Session {}: object stored in cache", session.id),
                Ok(false) => {}
                Err(e) => warn!("Session {}: can't cache object: {e}", session.id),
            }
        }
    }

    Ok(CompileOutcome {
        exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        object: Some(object_abs),
    })
}
