//! Bidirectional byte relay between an accepted client and a dialed backend

use bytes::Bytes;
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound for establishing a backend connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before a listener retries after a failed accept or receive
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Connect to a backend within [`CONNECT_TIMEOUT`].
pub async fn dial(addr: SocketAddr) -> io::Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", addr),
        )),
    }
}

/// Copy bytes both ways until either side is done.
///
/// `replay` is written to the backend before anything else read from the
/// client. Each direction runs as its own task; whichever finishes first
/// shuts its writer down and tells the other to stop, so both connections
/// are closed once this returns.
pub async fn relay<C, B>(client: C, backend: B, replay: Bytes) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);
    let closed = CancellationToken::new();

    let upstream = tokio::spawn(pipe(
        Cursor::new(replay).chain(client_read),
        backend_write,
        closed.clone(),
    ));
    let downstream = tokio::spawn(pipe(backend_read, client_write, closed));

    let (up, down) = tokio::join!(upstream, downstream);
    RelayStats {
        client_to_backend: up.unwrap_or_default(),
        backend_to_client: down.unwrap_or_default(),
    }
}

/// Sleep for [`ACCEPT_RETRY_DELAY`]. Returns `false` if `token` is
/// cancelled first, in which case the listener should exit.
pub async fn accept_backoff(token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

async fn pipe<R, W>(mut reader: R, mut writer: W, closed: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Relay read ended with error: {}", e);
                    break;
                }
            },
            _ = closed.cancelled() => break,
        };
        tokio::select! {
            result = writer.write_all(&buf[..n]) => {
                if let Err(e) = result {
                    debug!("Relay write ended with error: {}", e);
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
        copied += n as u64;
    }
    let _ = writer.shutdown().await;
    closed.cancel();
    copied
}
