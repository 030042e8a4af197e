use bytes::{BufMut, BytesMut};
use serde_json::json;
use tracing::debug;

use crate::errors::NdtError;
use crate::events::Events;
use crate::settings::NDT_VERSION_COMPAT;
use crate::transport::dialer::NdtStream;
use crate::ws::frame;
use crate::ws::stream::MAX_MESSAGE_SIZE;

pub(crate) const MSG_COMM_FAILURE: u8 = 0;
pub(crate) const MSG_SRV_QUEUE: u8 = 1;
pub(crate) const MSG_LOGIN: u8 = 2;
pub(crate) const MSG_TEST_PREPARE: u8 = 3;
pub(crate) const MSG_TEST_START: u8 = 4;
pub(crate) const MSG_TEST_MSG: u8 = 5;
pub(crate) const MSG_TEST_FINALIZE: u8 = 6;
pub(crate) const MSG_ERROR: u8 = 7;
pub(crate) const MSG_RESULTS: u8 = 8;
pub(crate) const MSG_LOGOUT: u8 = 9;
pub(crate) const MSG_WAITING: u8 = 10;
pub(crate) const MSG_EXTENDED_LOGIN: u8 = 11;

/// Preamble the legacy (non-WebSocket) server sends right after accept.
pub(crate) const MSG_KICKOFF: &[u8] = b"123456 654321";

/// Cap on any message-reading loop, so a confused server cannot keep us
/// around forever.
pub(crate) const MAX_LOOPS: usize = 256;

pub(crate) fn msg_type_name(code: u8) -> &'static str {
    match code {
        MSG_COMM_FAILURE => "comm_failure",
        MSG_SRV_QUEUE => "srv_queue",
        MSG_LOGIN => "login",
        MSG_TEST_PREPARE => "test_prepare",
        MSG_TEST_START => "test_start",
        MSG_TEST_MSG => "test_msg",
        MSG_TEST_FINALIZE => "test_finalize",
        MSG_ERROR => "error",
        MSG_RESULTS => "results",
        MSG_LOGOUT => "logout",
        MSG_WAITING => "waiting",
        MSG_EXTENDED_LOGIN => "extended_login",
        _ => "unknown",
    }
}

/// The control channel: the dialed stream plus the encoding flag that
/// decides how message bodies are rendered.
pub(crate) struct ControlConn {
    pub(crate) stream: NdtStream,
    json: bool,
}

impl ControlConn {
    pub(crate) fn new(stream: NdtStream, json: bool) -> ControlConn {
        ControlConn { stream, json }
    }

    /// Write header and body with the 3-byte legacy framing. Over
    /// WebSocket, header and body travel as the two frames of a single
    /// logical binary message (or a single frame when the body is
    /// empty).
    pub(crate) async fn msg_write_legacy(&mut self, code: u8, body: &[u8]) -> Result<(), NdtError> {
        if body.len() > u16::MAX as usize {
            return Err(NdtError::Protocol("message body too long".to_owned()));
        }
        let mut header = BytesMut::with_capacity(3);
        header.put_u8(code);
        header.put_u16(body.len() as u16);

        match &mut self.stream {
            NdtStream::Plain(conn) => {
                conn.send_all(&header).await?;
                if !body.is_empty() {
                    conn.send_all(body).await?;
                }
            }
            NdtStream::Ws(ws) => {
                if body.is_empty() {
                    ws.send_frame(true, frame::OP_BINARY, &header).await?;
                } else {
                    ws.send_frame(false, frame::OP_BINARY, &header).await?;
                    ws.send_frame(true, frame::OP_CONTINUATION, body).await?;
                }
            }
        }
        Ok(())
    }

    /// Encoding-aware write: wraps the body in `{"msg": …}` when the
    /// JSON dialect is active.
    pub(crate) async fn msg_write(&mut self, code: u8, body: &str) -> Result<(), NdtError> {
        debug!("sending message type {} body {:?}", code, body);
        if self.json {
            let rendered = json!({ "msg": body }).to_string();
            self.msg_write_legacy(code, rendered.as_bytes()).await
        } else {
            self.msg_write_legacy(code, body.as_bytes()).await
        }
    }

    /// The login message is special in both dialects: raw mode sends the
    /// bare suite byte as `login`, JSON mode an `extended_login` with
    /// the version and the suite rendered in decimal.
    pub(crate) async fn msg_write_login(&mut self, suite: u8) -> Result<(), NdtError> {
        if self.json {
            let body = json!({
                "msg": NDT_VERSION_COMPAT,
                "tests": suite.to_string(),
            })
            .to_string();
            self.msg_write_legacy(MSG_EXTENDED_LOGIN, body.as_bytes()).await
        } else {
            self.msg_write_legacy(MSG_LOGIN, &[suite]).await
        }
    }

    /// Read one legacy-framed message. Over WebSocket the whole message
    /// must arrive as one logical binary message of exactly 3+len bytes.
    pub(crate) async fn msg_read_legacy(&mut self) -> Result<(u8, Vec<u8>), NdtError> {
        match &mut self.stream {
            NdtStream::Plain(conn) => {
                let mut header = [0u8; 3];
                conn.recv_exact(&mut header).await?;
                let len = u16::from_be_bytes([header[1], header[2]]) as usize;
                let mut body = vec![0u8; len];
                conn.recv_exact(&mut body).await?;
                Ok((header[0], body))
            }
            NdtStream::Ws(ws) => {
                let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
                let Some((opcode, n)) = ws.recv_message(&mut buf).await? else {
                    return Err(NdtError::Eof);
                };
                if opcode != frame::OP_BINARY {
                    return Err(NdtError::WsProto("control message must be binary".to_owned()));
                }
                if n < 3 {
                    return Err(NdtError::Protocol("truncated message header".to_owned()));
                }
                let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
                if n != 3 + len {
                    return Err(NdtError::Protocol(format!(
                        "framing mismatch: websocket payload is {} bytes, header says {}",
                        n, len
                    )));
                }
                Ok((buf[0], buf[3..n].to_vec()))
            }
        }
    }

    /// Encoding-aware read: unwraps `{"msg": …}` bodies.
    pub(crate) async fn msg_read(&mut self) -> Result<(u8, String), NdtError> {
        let (code, raw) = self.msg_read_legacy().await?;
        let body = String::from_utf8(raw)
            .map_err(|_| NdtError::Protocol("message body is not valid UTF-8".to_owned()))?;
        if !self.json {
            debug!("received message type {} body {:?}", code, body);
            return Ok((code, body));
        }
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| NdtError::Protocol(format!("cannot parse JSON body: {}", e)))?;
        let msg = value
            .get("msg")
            .and_then(|m| m.as_str())
            .ok_or_else(|| NdtError::Protocol("JSON body has no 'msg' field".to_owned()))?;
        debug!("received message type {} body {:?}", code, msg);
        Ok((code, msg.to_owned()))
    }

    pub(crate) async fn msg_expect(&mut self, code: u8) -> Result<String, NdtError> {
        let (got, body) = self.msg_read().await?;
        if got != code {
            return Err(NdtError::Protocol(format!(
                "expected {} message, got {} ({})",
                msg_type_name(code),
                msg_type_name(got),
                got
            )));
        }
        Ok(body)
    }

    pub(crate) async fn msg_expect_empty(&mut self, code: u8) -> Result<(), NdtError> {
        let body = self.msg_expect(code).await?;
        if !body.is_empty() {
            return Err(NdtError::Protocol(format!(
                "expected empty body for message type {}, got {:?}",
                code, body
            )));
        }
        Ok(())
    }
}

/// TEST_PREPARE options for the throughput sub-tests: options[0] is the
/// measurement port, options[5] (when present) the flow count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TestPrepare {
    pub port: u16,
    pub nflows: u8,
}

pub(crate) fn parse_test_prepare(body: &str) -> Result<TestPrepare, NdtError> {
    let options: Vec<&str> = body.split(' ').collect();

    let port = options
        .first()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|port| *port >= 1)
        .ok_or_else(|| {
            NdtError::Protocol(format!("cannot parse port from test_prepare {:?}", body))
        })?;

    let mut nflows = 1u8;
    if options.len() >= 6 {
        nflows = options[5]
            .parse::<u8>()
            .ok()
            .filter(|n| (1..=16).contains(n))
            .ok_or_else(|| {
                NdtError::Protocol(format!("cannot parse flow count from test_prepare {:?}", body))
            })?;
    }

    Ok(TestPrepare { port, nflows })
}

/// Report a message of newline-separated `key: value` lines to the
/// collector under the given scope.
pub(crate) fn emit_result_lines(events: &Events, scope: &str, message: &str) -> Result<(), NdtError> {
    for line in message.split('\n') {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split(':');
        let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(NdtError::Protocol(format!("malformed result line {:?}", line)));
        };
        events.on_result(scope, key.trim(), value.trim());
    }
    Ok(())
}
