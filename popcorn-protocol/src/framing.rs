//! Length-prefixed frame transport
//!
//! Every message travels as a big-endian `u32` payload length followed by
//! the binrw-encoded payload. The fixed five-byte [`Hello`] handshake is the
//! only unframed data on a connection.

use crate::error::{Error, Result};
use crate::messages::Hello;
use binrw::{BinRead, BinWrite, Endian};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame payload. The transport must carry whole
/// compile epilogues (captured compiler output), so the cap is generous;
/// file content is chunked far below it.
pub const MAX_FRAME_LEN: u32 = 1 << 30;

fn encode<T>(message: &T) -> Result<Vec<u8>>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(Vec::new());
    message.write_options(&mut cursor, Endian::Big, ())?;
    Ok(cursor.into_inner())
}

fn decode<T>(payload: Vec<u8>) -> Result<T>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(payload);
    Ok(T::read_options(&mut cursor, Endian::Big, ())?)
}

/// Write one framed message
pub async fn write_frame<S, T>(stream: &mut S, message: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let payload = encode(message)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(Error::FrameTooLarge {
            length: payload.len() as u64,
            limit: u64::from(MAX_FRAME_LEN),
        });
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message
pub async fn read_frame<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncRead + Unpin,
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::UnexpectedEof);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            length: u64::from(len),
            limit: u64::from(MAX_FRAME_LEN),
        });
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    decode(payload)
}

/// Send the connection handshake
pub async fn write_hello<S: AsyncWrite + Unpin>(stream: &mut S, hello: Hello) -> Result<()> {
    let bytes = encode(&hello)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Receive and validate the connection handshake
pub async fn read_hello<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Hello> {
    let mut bytes = [0u8; 5];
    match stream.read_exact(&mut bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::UnexpectedEof);
        }
        Err(e) => return Err(e.into()),
    }
    decode(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Method, TransferReply};

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let sent = TransferReply::Refused {
            reason: "unknown session 9".into(),
        };
        write_frame(&mut a, &sent).await.expect("write");

        let received: TransferReply = read_frame(&mut b).await.expect("read");
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_hello_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_hello(
            &mut a,
            Hello {
                method: Method::CompileSource,
            },
        )
        .await
        .expect("write");

        let hello = read_hello(&mut b).await.expect("read");
        assert_eq!(hello.method, Method::CompileSource);
    }

    #[tokio::test]
    async fn test_oversize_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Forge a length header far past the limit; no payload follows.
        a.write_u32(MAX_FRAME_LEN + 1).await.expect("write len");

        let result: Result<TransferReply> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_closed_stream_reads_as_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let result: Result<TransferReply> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_bad_magic_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"NOPE\x01").await.expect("write");

        assert!(read_hello(&mut b).await.is_err());
    }
}
