//! Client-side connection helpers

use crate::error::{Error, Result};
use crate::framing::write_hello;
use crate::messages::{Hello, Method};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Connect timeout for a single server
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Deadline applied by callers around every whole RPC
pub const RPC_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Open a connection for one RPC: TCP connect plus the method handshake
pub async fn connect(address: &str, method: Method) -> Result<TcpStream> {
    debug!("Connecting to compilation server at {address} for {method:?}");
    let mut stream = match timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(address),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) => {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
            });
        }
        Err(_) => {
            return Err(Error::ConnectionTimeout {
                address: address.to_string(),
                timeout_secs: CONNECT_TIMEOUT_SECS,
            });
        }
    };
    stream.set_nodelay(true)?;
    write_hello(&mut stream, Hello { method }).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::read_hello;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_performs_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            read_hello(&mut socket).await.expect("hello")
        });

        let _stream = connect(&address, Method::Status).await.expect("connect");
        let hello = accept.await.expect("join");
        assert_eq!(hello.method, Method::Status);
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_as_error() {
        // Bind-then-drop guarantees nothing is listening on the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let result = connect(&address, Method::Status).await;
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    }
}
