//! Client driver for the popcorn distributed compiler
//!
//! The binary wraps a compiler command line. When the invocation is
//! remote-safe and servers are configured, the driver enumerates the
//! translation unit's inputs, ships them to a deterministically chosen
//! server and streams the object back; on any protocol or transport
//! failure it silently builds locally instead. Only compiler diagnostics
//! from a completed remote session are authoritative.

pub mod check;
pub mod compiler;
pub mod error;
pub mod identity;
pub mod remote;
pub mod select;
pub mod settings;

pub use check::check_servers;
pub use compiler::LocalCompiler;
pub use error::{Error, Result};
pub use settings::ClientSettings;

use tracing::{info, warn};

/// Compile the given command line, remotely when possible, locally
/// otherwise. Returns the authoritative (exit code, stdout, stderr).
pub async fn perform_compilation(
    argv: &[String],
    settings: &ClientSettings,
) -> (i32, Vec<u8>, Vec<u8>) {
    let mut local = LocalCompiler::new(argv);
    if local.remote_allowed && !settings.servers.is_empty() {
        info!("Trying remote compilation of {}", local.in_file);
        match remote::compile_remotely(settings, &mut local).await {
            Ok(result) => return result,
            Err(e) => warn!("Can't compile remotely: {e}"),
        }
    }
    local.compile_locally().await
}
