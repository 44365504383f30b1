//! Error types for the popcorn cache crate

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A path without a final component cannot be cached
    #[error("Path has no usable file name: {0}")]
    NoFileName(PathBuf),
}
