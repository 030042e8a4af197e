pub(crate) mod dialer;
pub(crate) mod socks5;
pub(crate) mod tls;

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::errors::NdtError;

/// The byte-stream seam between the transport stack and the protocol
/// engines: every layer ends up boxed behind this, so the engines never
/// know whether they talk through TLS, a proxy tunnel, or a bare socket.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

/// One dialed connection plus the bookkeeping that survives layering:
/// the timeout gating every operation and, on unix, the raw fd of the
/// underlying TCP socket (used for TCP_INFO snapshots).
pub struct Connection {
    conn: BoxConn,
    pub(crate) raw_fd: Option<i32>,
    pub(crate) io_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(conn: BoxConn, raw_fd: Option<i32>, io_timeout: Duration) -> Connection {
        Connection { conn, raw_fd, io_timeout }
    }

    pub(crate) fn into_conn(self) -> BoxConn {
        self.conn
    }

    /// Read some bytes. `Ok(0)` means the peer closed the stream.
    pub(crate) async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NdtError> {
        match timeout(self.io_timeout, self.conn.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(NdtError::Timeout),
        }
    }

    /// Read exactly `buf.len()` bytes; a stream that ends short is `Eof`.
    pub(crate) async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), NdtError> {
        match timeout(self.io_timeout, self.conn.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(NdtError::Eof),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(NdtError::Timeout),
        }
    }

    /// Write the whole buffer or fail.
    pub(crate) async fn send_all(&mut self, buf: &[u8]) -> Result<(), NdtError> {
        match timeout(self.io_timeout, self.conn.write_all(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(NdtError::Timeout),
        }
    }

    /// Give the peer a bounded chance to close first, then drop the
    /// connection regardless.
    pub(crate) async fn wait_close(mut self) {
        let mut scratch = [0u8; 1];
        let _ = timeout(Duration::from_secs(3), self.conn.read(&mut scratch)).await;
    }
}
