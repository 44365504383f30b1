//! Compilation server for the popcorn distributed compiler
//!
//! The server accepts one RPC per connection (StartSession, TransferFile,
//! CompileSource, CloseSession, Status), assembles a sandboxed source tree
//! per session out of its content-addressed caches and client uploads, runs
//! the real compiler, and streams the produced object back. All cache state
//! is warm only; a restart starts from an empty working directory.

pub mod compile;
pub mod error;
pub mod housekeeping;
pub mod logging;
pub mod object_key;
pub mod paths;
pub mod service;
pub mod sessions;
pub mod settings;
pub mod stats;
pub mod transfer;

pub use error::{Error, Result};
pub use service::{ServerState, serve};
pub use settings::ServerSettings;
