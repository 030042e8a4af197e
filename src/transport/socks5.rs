use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::errors::{NdtError, Socks5Error};

use super::Connection;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAINNAME: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// RFC 1928 client handshake over a freshly dialed proxy connection,
/// with hostname resolution delegated to the proxy (ATYP DOMAINNAME).
pub(crate) async fn handshake(conn: &mut Connection, hostname: &str, port: u16) -> Result<(), NdtError> {
    if hostname.len() > u8::MAX as usize {
        return Err(Socks5Error::HostnameTooLong.into());
    }

    conn.send_all(&[VERSION, 1, METHOD_NO_AUTH]).await?;

    let mut method = [0u8; 2];
    conn.recv_exact(&mut method).await?;
    if method != [VERSION, METHOD_NO_AUTH] {
        return Err(Socks5Error::Malformed.into());
    }

    let mut request = BytesMut::with_capacity(7 + hostname.len());
    request.put_u8(VERSION);
    request.put_u8(CMD_CONNECT);
    request.put_u8(0x00); // reserved
    request.put_u8(ATYP_DOMAINNAME);
    request.put_u8(hostname.len() as u8);
    request.put_slice(hostname.as_bytes());
    request.put_u16(port);
    conn.send_all(&request).await?;

    let mut reply = [0u8; 4];
    conn.recv_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(Socks5Error::Malformed.into());
    }
    if reply[1] != 0x00 {
        return Err(Socks5Error::from_reply_code(reply[1]).into());
    }

    // The rest of the reply is the bind address, which we do not use.
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAINNAME => {
            let mut len = [0u8; 1];
            conn.recv_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(Socks5Error::Malformed.into()),
    };
    let mut bind_addr = vec![0u8; addr_len + 2];
    conn.recv_exact(&mut bind_addr).await?;

    debug!("socks5h tunnel to {}:{} established", hostname, port);
    Ok(())
}
