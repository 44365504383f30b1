//! Wire protocol for the popcorn distributed compiler
//!
//! This crate is shared by the client driver and the compilation server. It
//! provides:
//! - 256-bit content digests with a stable big-endian wire form
//! - every message of the session protocol (StartSession, TransferFile,
//!   CompileSource, CloseSession, Status) as binrw types
//! - the length-prefixed frame transport and connection handshake

pub mod client;
pub mod digest;
pub mod error;
pub mod framing;
pub mod messages;

pub use client::{RPC_DEADLINE, connect};
pub use digest::ContentDigest;
pub use error::{Error, Result};
pub use framing::{MAX_FRAME_LEN, read_frame, read_hello, write_frame, write_hello};
pub use messages::{
    CHUNK_SIZE, CloseSessionReply, CloseSessionRequest, CompileReply, CompileSourceRequest,
    FileAction, FileMeta, FileStatus, Hello, Method, PROTOCOL_MAGIC, StartSessionReply,
    StartSessionRequest, StatusReply, StatusRequest, TransferReply, TransferRequest, WireBytes,
    WireString,
};
