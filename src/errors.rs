use std::io;
use thiserror::Error;

/// Everything that can go wrong between dialing a server and tearing the
/// connection down again. Socket-level failures keep their `ErrorKind`
/// inside the `Io` variant; the remaining variants tag conditions the
/// operating system has no word for.
#[derive(Debug, Error)]
pub enum NdtError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out")]
    Timeout,

    /// The peer closed the stream. Expected during steady-state receive,
    /// fatal everywhere else.
    #[error("end of stream")]
    Eof,

    #[error("message of {actual} bytes exceeds the {limit} byte limit")]
    MessageSize { actual: u64, limit: u64 },

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("SOCKS5 handshake failed: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("websocket protocol violation: {0}")]
    WsProto(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server discovery failed: {0}")]
    Discovery(String),
}

impl NdtError {
    /// Broken pipe is the normal way an upload ends: the server stops
    /// reading once it has measured enough. Senders treat it quietly.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, NdtError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, NdtError::Eof)
    }
}

/// Reply codes of RFC 1928 §6, plus the ways a reply can be malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Socks5Error {
    #[error("general server failure")]
    GeneralFailure,
    #[error("connection not allowed by ruleset")]
    NotAllowed,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("TTL expired")]
    TtlExpired,
    #[error("command not supported")]
    CommandNotSupported,
    #[error("address type not supported")]
    AddressTypeNotSupported,
    #[error("unassigned reply code {0}")]
    Unassigned(u8),
    #[error("malformed reply")]
    Malformed,
    #[error("hostname exceeds 255 bytes")]
    HostnameTooLong,
}

impl Socks5Error {
    pub(crate) fn from_reply_code(code: u8) -> Socks5Error {
        match code {
            0x01 => Socks5Error::GeneralFailure,
            0x02 => Socks5Error::NotAllowed,
            0x03 => Socks5Error::NetworkUnreachable,
            0x04 => Socks5Error::HostUnreachable,
            0x05 => Socks5Error::ConnectionRefused,
            0x06 => Socks5Error::TtlExpired,
            0x07 => Socks5Error::CommandNotSupported,
            0x08 => Socks5Error::AddressTypeNotSupported,
            other => Socks5Error::Unassigned(other),
        }
    }
}
