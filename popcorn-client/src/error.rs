//! Error types for the client driver

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for client operations. Any of these makes the driver fall
/// back to a local build; a compiler diagnostic is not an error.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] popcorn_protocol::Error),

    /// No servers are configured
    #[error("No available hosts for connection")]
    NoAvailableHosts,

    /// The server refused an RPC
    #[error("Server refused: {0}")]
    Refused(String),

    /// The server answered with a message the protocol does not allow here
    #[error("Unexpected server reply: {0}")]
    UnexpectedReply(String),

    /// An RPC overran its deadline
    #[error("RPC deadline of {0} seconds exceeded")]
    DeadlineExceeded(u64),

    /// Header enumeration via the local compiler failed
    #[error("Can't enumerate translation unit inputs: {0}")]
    InputEnumeration(String),
}
