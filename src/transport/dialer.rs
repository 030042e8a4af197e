use std::time::Duration;

#[cfg(unix)]
use std::os::fd::AsRawFd;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::NdtError;
use crate::settings::{ProtocolFlags, Settings};
use crate::ws;
use crate::ws::stream::WsStream;

use super::{socks5, tls, Connection};

/// What the WebSocket layer should negotiate when it is part of the
/// stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WsConfig<'a> {
    pub path: &'a str,
    pub subprotocol: &'a str,
}

/// A fully dialed stream: either the (possibly TLS-wrapped) byte stream
/// or the WebSocket decorator on top of it.
pub(crate) enum NdtStream {
    Plain(Connection),
    Ws(WsStream),
}

/// Dial the composed stack for `hostname:port`: TCP, then the SOCKS5h
/// tunnel when configured, then TLS when selected, then the WebSocket
/// upgrade when requested. Failed attempts drop (and thereby close)
/// every partially built layer.
pub(crate) async fn dial(
    settings: &Settings,
    hostname: &str,
    port: u16,
    ws: Option<WsConfig<'_>>,
) -> Result<NdtStream, NdtError> {
    let mut conn = dial_base(settings, hostname, port).await?;
    match ws {
        Some(config) => {
            upgrade(&mut conn, settings, hostname, port, config).await?;
            Ok(NdtStream::Ws(WsStream::new(conn)))
        }
        None => Ok(NdtStream::Plain(conn)),
    }
}

/// Like `dial` with a mandatory WebSocket layer; used by ndt7, which has
/// no non-WebSocket mode.
pub(crate) async fn dial_ws(
    settings: &Settings,
    hostname: &str,
    port: u16,
    config: WsConfig<'_>,
) -> Result<WsStream, NdtError> {
    let mut conn = dial_base(settings, hostname, port).await?;
    upgrade(&mut conn, settings, hostname, port, config).await?;
    Ok(WsStream::new(conn))
}

async fn upgrade(
    conn: &mut Connection,
    settings: &Settings,
    hostname: &str,
    port: u16,
    config: WsConfig<'_>,
) -> Result<(), NdtError> {
    let tls_active = settings.protocol_flags.contains(ProtocolFlags::TLS);
    ws::handshake::upgrade(conn, hostname, port, tls_active, config.path, config.subprotocol).await
}

async fn dial_base(settings: &Settings, hostname: &str, port: u16) -> Result<Connection, NdtError> {
    let stream = match settings.socks5h_port {
        Some(proxy_port) => tcp_dial("127.0.0.1", proxy_port, settings.io_timeout).await?,
        None => tcp_dial(hostname, port, settings.io_timeout).await?,
    };

    #[cfg(unix)]
    let raw_fd = Some(stream.as_raw_fd());
    #[cfg(not(unix))]
    let raw_fd = None;

    let mut conn = Connection::new(Box::new(stream), raw_fd, settings.io_timeout);
    if settings.socks5h_port.is_some() {
        socks5::handshake(&mut conn, hostname, port).await?;
    }
    if settings.protocol_flags.contains(ProtocolFlags::TLS) {
        let wrapped = tls::wrap(conn.into_conn(), hostname, settings).await?;
        conn = Connection::new(wrapped, raw_fd, settings.io_timeout);
    }
    Ok(conn)
}

/// Resolve and connect, taking the first address that answers within
/// the timeout.
async fn tcp_dial(hostname: &str, port: u16, io_timeout: Duration) -> Result<TcpStream, NdtError> {
    let addrs: Vec<_> = lookup_host((hostname, port))
        .await
        .map_err(|e| NdtError::Resolve(format!("{}: {}", hostname, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(NdtError::Resolve(hostname.to_owned()));
    }

    let mut last_error = None;
    for addr in addrs {
        match timeout(io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("connected to {}", addr);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                warn!("connect to {} failed: {}", addr, e);
                last_error = Some(e.into());
            }
            Err(_) => {
                warn!("connect to {} timed out", addr);
                last_error = Some(NdtError::Timeout);
            }
        }
    }
    Err(last_error.unwrap_or(NdtError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dial_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = tcp_dial("127.0.0.1", port, Duration::from_secs(7)).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        // bind and immediately drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = tcp_dial("127.0.0.1", port, Duration::from_secs(7)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_plain_returns_plain_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut settings = Settings::default();
        settings.hostname = "127.0.0.1".to_owned();
        let stream = dial(&settings, "127.0.0.1", port, None).await.unwrap();
        assert!(matches!(stream, NdtStream::Plain(_)));
    }
}
