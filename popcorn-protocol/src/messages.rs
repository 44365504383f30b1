//! Wire messages for the four-step session protocol
//!
//! Every message is binrw-encoded in big-endian form. Variable-length
//! strings and byte blobs are `u32`-counted ([`WireString`], [`WireBytes`]).
//! Tagged enums carry a one-byte magic per variant, so a stream reader can
//! always tell object chunks, epilogues and refusals apart.

use crate::digest::ContentDigest;
use binrw::io::{Read, Seek, Write};
use binrw::{BinRead, BinResult, BinWrite, Endian, binrw};

/// Handshake magic sent at the start of every connection
pub const PROTOCOL_MAGIC: [u8; 4] = *b"POP1";

/// Maximum size of a single file-content chunk on the wire
pub const CHUNK_SIZE: usize = 128 * 1024;

/// A `u32`-counted UTF-8 string
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct WireString(pub String);

impl WireString {
    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WireString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WireString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl BinRead for WireString {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let pos = reader.stream_position().unwrap_or_default();
        let len = u32::read_options(reader, Endian::Big, ())?;
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map(Self)
            .map_err(|err| binrw::Error::Custom {
                pos,
                err: Box::new(err),
            })
    }
}

impl BinWrite for WireString {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        (self.0.len() as u32).write_options(writer, Endian::Big, ())?;
        writer.write_all(self.0.as_bytes())?;
        Ok(())
    }
}

/// A `u32`-counted byte blob
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireBytes(pub Vec<u8>);

impl WireBytes {
    /// True when the blob carries no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for WireBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for WireBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl BinRead for WireBytes {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let len = u32::read_options(reader, Endian::Big, ())?;
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        Ok(Self(buf))
    }
}

impl BinWrite for WireBytes {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        (self.0.len() as u32).write_options(writer, Endian::Big, ())?;
        writer.write_all(&self.0)?;
        Ok(())
    }
}

/// RPC selector sent right after the protocol magic
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Open a compilation session and learn per-file statuses
    #[brw(magic = 1u8)]
    StartSession,
    /// Resolve or upload a single required file
    #[brw(magic = 2u8)]
    TransferFile,
    /// Run the compiler and stream the object back
    #[brw(magic = 3u8)]
    CompileSource,
    /// Tear down a session explicitly
    #[brw(magic = 4u8)]
    CloseSession,
    /// Report server health counters
    #[brw(magic = 5u8)]
    Status,
}

/// Connection handshake: magic plus the method this connection will carry
#[binrw]
#[brw(big, magic = b"POP1")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// The RPC spoken on this connection
    pub method: Method,
}

/// Client-observed identity of one required file
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Absolute path on the client machine
    pub path: WireString,
    /// Modification time in nanoseconds since the epoch
    pub mtime_ns: i64,
    /// File size in bytes
    pub size: i64,
}

/// What the client must do for one file after StartSession
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// The server needs the content digest before it can decide
    #[brw(magic = 1u8)]
    Sha256Required,
    /// The server needs the full file body
    #[brw(magic = 2u8)]
    FullCopyRequired,
}

/// Per-file entry of the StartSession reply
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    /// Index into the request's `required_files`
    pub index: u32,
    /// Required client action
    pub action: FileAction,
}

/// StartSession request
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionRequest {
    /// Stable identity of the client machine/user pair
    pub client_id: ContentDigest,
    /// Client account name, used for path-prefix neutralization
    pub user_name: WireString,
    /// Compiler executable name
    pub compiler: WireString,
    /// Compiler argv without `-o` and the source file
    #[br(temp)]
    #[bw(calc = compiler_args.len() as u32)]
    arg_count: u32,
    #[br(count = arg_count)]
    pub compiler_args: Vec<WireString>,
    /// Absolute source path on the client
    pub source_path: WireString,
    /// Every file the translation unit reads, source included
    #[br(temp)]
    #[bw(calc = required_files.len() as u32)]
    file_count: u32,
    #[br(count = file_count)]
    pub required_files: Vec<FileMeta>,
    /// Enables the compiled-object cache for this session
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v| u8::from(*v))]
    pub use_object_cache: bool,
}

/// StartSession reply
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartSessionReply {
    /// Session opened; absent indices are already satisfied server-side
    #[brw(magic = 0u8)]
    Opened {
        /// Identifier for the subsequent RPCs
        session_id: u64,
        #[br(temp)]
        #[bw(calc = required_files.len() as u32)]
        count: u32,
        /// Files that still need client action
        #[br(count = count)]
        required_files: Vec<FileStatus>,
    },
    /// Session could not be opened
    #[brw(magic = 1u8)]
    Refused {
        /// Human-readable reason
        reason: WireString,
    },
}

/// Client-side messages of a TransferFile stream
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    /// Stream opener naming the file being resolved
    #[brw(magic = 0u8)]
    Header {
        /// Session the file belongs to
        session_id: u64,
        /// Index into the session's required files
        file_index: u32,
        /// Content digest, or the all-zero sentinel when not computed yet
        sha256: ContentDigest,
    },
    /// One body chunk; a zero-length chunk terminates the upload
    #[brw(magic = 1u8)]
    Chunk {
        /// At most [`CHUNK_SIZE`] bytes of file content
        data: WireBytes,
    },
}

/// Server-side messages of a TransferFile stream
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReply {
    /// The file is resolved; no further action for it
    #[brw(magic = 0u8)]
    Done,
    /// Re-send the header with a computed digest
    #[brw(magic = 1u8)]
    Sha256Required,
    /// Upload the file body as chunks
    #[brw(magic = 2u8)]
    FullCopyRequired,
    /// The transfer failed server-side
    #[brw(magic = 3u8)]
    Refused {
        /// Human-readable reason
        reason: WireString,
    },
}

/// CompileSource request
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileSourceRequest {
    /// Session to compile
    pub session_id: u64,
    /// Tear the session down after the reply stream completes
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v| u8::from(*v))]
    pub close_after_build: bool,
}

/// Server-side messages of a CompileSource stream
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileReply {
    /// One chunk of the produced object file
    #[brw(magic = 0u8)]
    Chunk {
        /// At most [`CHUNK_SIZE`] bytes of object content
        data: WireBytes,
    },
    /// Final message: compiler exit status and captured output
    #[brw(magic = 1u8)]
    Epilogue {
        /// Compiler process exit code
        exit_code: i32,
        /// Captured standard output
        stdout: WireBytes,
        /// Captured standard error
        stderr: WireBytes,
    },
    /// The compilation could not be run at all
    #[brw(magic = 2u8)]
    Refused {
        /// Human-readable reason
        reason: WireString,
    },
}

/// CloseSession request
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSessionRequest {
    /// Session to tear down
    pub session_id: u64,
}

/// CloseSession reply
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseSessionReply {
    /// Session state and working directory are gone
    #[brw(magic = 0u8)]
    Closed,
    /// The session id was not known
    #[brw(magic = 1u8)]
    Refused {
        /// Human-readable reason
        reason: WireString,
    },
}

/// Status request
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRequest {}

/// Status reply: a health snapshot of one server
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    /// Server build version
    pub version: WireString,
    /// Seconds since the server started
    pub uptime_secs: u64,
    /// Currently open sessions
    pub active_sessions: u64,
    /// Clients with a live identity cache
    pub known_clients: u64,
    /// Entries in the system-header cache
    pub system_headers: u64,
    /// Entries in the source file cache
    pub src_cache_files: u64,
    /// Bytes held by the source file cache
    pub src_cache_bytes: u64,
    /// Entries in the object file cache
    pub obj_cache_files: u64,
    /// Bytes held by the object file cache
    pub obj_cache_bytes: u64,
}
