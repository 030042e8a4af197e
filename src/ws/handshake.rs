use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::errors::NdtError;
use crate::transport::Connection;
use crate::util::random;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_LINE_LEN: usize = 8000;
const MAX_HEADER_LINES: usize = 1000;

// Response facts that must all be present before the blank line.
const FACT_UPGRADE: u8 = 1 << 0;
const FACT_CONNECTION: u8 = 1 << 1;
const FACT_ACCEPT: u8 = 1 << 2;
const FACT_PROTOCOL: u8 = 1 << 3;
const FACTS_ALL: u8 = FACT_UPGRADE | FACT_CONNECTION | FACT_ACCEPT | FACT_PROTOCOL;

/// Upgrade `conn` to a WebSocket: send the HTTP/1.1 upgrade request with
/// a fresh nonce and scan the response until the blank line, requiring
/// the 101 status line and all four upgrade headers. Redirects are not
/// followed.
pub(crate) async fn upgrade(
    conn: &mut Connection,
    hostname: &str,
    port: u16,
    tls_active: bool,
    path: &str,
    subprotocol: &str,
) -> Result<(), NdtError> {
    let key = BASE64.encode(random::ws_nonce());
    let expected_accept = accept_for_key(&key);

    let default_port = if tls_active { 443 } else { 80 };
    let host_header = if port == default_port {
        hostname.to_owned()
    } else {
        format!("{}:{}", hostname, port)
    };

    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {}\r\n\
         \r\n",
        path, host_header, key, subprotocol,
    );
    conn.send_all(request.as_bytes()).await?;

    let status = read_line(conn).await?;
    if status != "HTTP/1.1 101 Switching Protocols" {
        return Err(NdtError::WsProto(format!("unexpected status line: {:?}", status)));
    }

    let mut facts = 0u8;
    for _ in 0..MAX_HEADER_LINES {
        let line = read_line(conn).await?;
        if line.is_empty() {
            if facts == FACTS_ALL {
                debug!("websocket upgrade to {}{} complete", host_header, path);
                return Ok(());
            }
            return Err(NdtError::WsProto(
                "upgrade response is missing required headers".to_owned(),
            ));
        }
        facts |= classify_header(&line, &expected_accept, subprotocol);
    }
    Err(NdtError::WsProto("too many header lines".to_owned()))
}

/// The Sec-WebSocket-Accept value a compliant server derives from our
/// key: base64 of the SHA-1 over key + RFC 6455 GUID.
pub(crate) fn accept_for_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Which response fact, if any, this header line establishes. Names and
/// the Upgrade/Connection token values match case-insensitively; the
/// accept hash and the subprotocol echo must match exactly.
fn classify_header(line: &str, expected_accept: &str, subprotocol: &str) -> u8 {
    let Some((name, value)) = line.split_once(':') else {
        return 0;
    };
    let value = value.trim();
    if name.eq_ignore_ascii_case("upgrade") && value.eq_ignore_ascii_case("websocket") {
        FACT_UPGRADE
    } else if name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("upgrade") {
        FACT_CONNECTION
    } else if name.eq_ignore_ascii_case("sec-websocket-accept") && value == expected_accept {
        FACT_ACCEPT
    } else if name.eq_ignore_ascii_case("sec-websocket-protocol") && value == subprotocol {
        FACT_PROTOCOL
    } else {
        0
    }
}

/// Read one CRLF-terminated line byte by byte: whatever follows the
/// final header already belongs to the first frame and must not be
/// consumed from the stream.
async fn read_line(conn: &mut Connection) -> Result<String, NdtError> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        conn.recv_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LEN {
            return Err(NdtError::WsProto("header line too long".to_owned()));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| NdtError::WsProto("header line is not valid UTF-8".to_owned()))
}
