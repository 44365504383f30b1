//! Error types for the compilation server

use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for server operations
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error on a connection
    #[error("Protocol error: {0}")]
    Protocol(#[from] popcorn_protocol::Error),

    /// Cache layer error
    #[error("Cache error: {0}")]
    Cache(#[from] popcorn_cache::Error),

    /// The client broke the stream contract
    #[error("Protocol violation: {0}")]
    Violation(String),
}
