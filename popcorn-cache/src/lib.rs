//! Server-side caches for the popcorn distributed compiler
//!
//! The compilation server keeps three kinds of warm state, all provided by
//! this crate:
//! - per-client file-identity caches (`path + mtime + size → digest`)
//! - two bounded content-addressed file caches, one for sources/headers and
//!   one for compiled objects, materialized into sessions by hard link
//! - a digest cache for headers that exist on the server's own filesystem
//!
//! plus the in-flight transfer registry that keeps N concurrent sessions
//! from uploading the same blob N times. Nothing here survives a restart;
//! the caches are warm state, not a store of record.

pub mod error;
pub mod file_cache;
pub mod identity;
pub mod system;
pub mod transfer;

pub use error::{Error, Result};
pub use file_cache::FileCache;
pub use identity::{ClientEntry, ClientRegistry, FileIdentityCache};
pub use system::SystemHeaderCache;
pub use transfer::TransferRegistry;
