//! Error types for the popcorn wire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while speaking the popcorn protocol
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] binrw::Error),

    /// A frame exceeded the transport limit
    #[error("Frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Observed payload length
        length: u64,
        /// Maximum allowed payload length
        limit: u64,
    },

    /// Failed to connect to a compilation server
    #[error("Connection failed to {address}")]
    ConnectionFailed {
        /// The `host:port` pair that failed to connect
        address: String,
    },

    /// Connection attempt timed out
    #[error("Connection timed out after {timeout_secs}s to {address}")]
    ConnectionTimeout {
        /// The `host:port` pair that timed out
        address: String,
        /// The timeout duration in seconds
        timeout_secs: u64,
    },

    /// The peer closed the stream mid-message
    #[error("Peer closed the connection unexpectedly")]
    UnexpectedEof,

    /// The server refused an RPC with a reason
    #[error("Server refused the call: {0}")]
    Refused(String),
}
