use tracing::debug;

use crate::errors::NdtError;
use crate::transport::Connection;
use crate::util::random;

use super::frame;

/// Ceiling for one logical message, shared by the legacy control-message
/// carriage and the ndt7 loops.
pub(crate) const MAX_MESSAGE_SIZE: usize = 1 << 17;

/// One received data frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub len: usize,
}

/// Client side of an upgraded WebSocket connection. Frames we send are
/// masked; frames we receive must not be.
pub(crate) struct WsStream {
    conn: Connection,
}

impl WsStream {
    pub(crate) fn new(conn: Connection) -> WsStream {
        WsStream { conn }
    }

    pub(crate) fn raw_fd(&self) -> Option<i32> {
        self.conn.raw_fd
    }

    pub(crate) fn into_conn(self) -> Connection {
        self.conn
    }

    /// Send one frame; header and masked payload leave in a single write.
    pub(crate) async fn send_frame(&mut self, fin: bool, opcode: u8, payload: &[u8]) -> Result<(), NdtError> {
        let buf = frame::build_frame(fin, opcode, random::mask_key(), payload);
        self.conn.send_all(&buf).await
    }

    /// Send a frame serialized ahead of time with `frame::build_frame`.
    /// The upload paths mask one frame once and resend it for the whole
    /// sub-test.
    pub(crate) async fn send_prebuilt(&mut self, frame: &[u8]) -> Result<(), NdtError> {
        self.conn.send_all(frame).await
    }

    pub(crate) async fn send_text(&mut self, payload: &[u8]) -> Result<(), NdtError> {
        self.send_frame(true, frame::OP_TEXT, payload).await
    }

    /// Read one frame into `buf`, applying every validity rule the
    /// server side can violate.
    async fn recv_any_frame(&mut self, buf: &mut [u8]) -> Result<Frame, NdtError> {
        let mut head = [0u8; 2];
        self.conn.recv_exact(&mut head).await?;
        let partial = frame::parse_first_bytes(head[0], head[1])?;
        if partial.masked {
            return Err(NdtError::WsProto("server frames must not be masked".to_owned()));
        }

        let ext_len = frame::extended_len_bytes(partial.len7);
        let len = if ext_len == 0 {
            partial.len7 as u64
        } else {
            let mut ext = [0u8; 8];
            self.conn.recv_exact(&mut ext[..ext_len]).await?;
            frame::parse_extended_len(partial.len7, &ext[..ext_len])?
        };

        if frame::is_control(partial.opcode) {
            if !partial.fin {
                return Err(NdtError::WsProto("fragmented control frame".to_owned()));
            }
            if len > 125 {
                return Err(NdtError::WsProto("control frame payload too large".to_owned()));
            }
        }
        if len > buf.len() as u64 {
            return Err(NdtError::MessageSize { actual: len, limit: buf.len() as u64 });
        }

        self.conn.recv_exact(&mut buf[..len as usize]).await?;
        Ok(Frame { fin: partial.fin, opcode: partial.opcode, len: len as usize })
    }

    /// Like `recv_any_frame` with the control-frame policy applied:
    /// CLOSE is acknowledged and reported as end of stream (`None`),
    /// PING is answered with a PONG echoing the payload, PONG is
    /// skipped.
    pub(crate) async fn recv_logical_frame(&mut self, buf: &mut [u8]) -> Result<Option<Frame>, NdtError> {
        loop {
            let received = self.recv_any_frame(buf).await?;
            match received.opcode {
                frame::OP_CLOSE => {
                    debug!("peer sent CLOSE, acknowledging");
                    let _ = self.send_frame(true, frame::OP_CLOSE, &[]).await;
                    return Ok(None);
                }
                frame::OP_PING => {
                    let echo = buf[..received.len].to_vec();
                    self.send_frame(true, frame::OP_PONG, &echo).await?;
                }
                frame::OP_PONG => {}
                _ => return Ok(Some(received)),
            }
        }
    }

    /// Assemble one logical message: a text or binary frame plus any
    /// continuations until FIN. `Ok(None)` means the peer closed
    /// cleanly.
    pub(crate) async fn recv_message(&mut self, buf: &mut [u8]) -> Result<Option<(u8, usize)>, NdtError> {
        let Some(first) = self.recv_logical_frame(buf).await? else {
            return Ok(None);
        };
        if first.opcode != frame::OP_TEXT && first.opcode != frame::OP_BINARY {
            return Err(NdtError::WsProto(
                "message must start with a text or binary frame".to_owned(),
            ));
        }

        let mut total = first.len;
        let mut fin = first.fin;
        while !fin {
            let Some(next) = self.recv_logical_frame(&mut buf[total..]).await? else {
                return Err(NdtError::Eof);
            };
            if next.opcode != frame::OP_CONTINUATION {
                return Err(NdtError::WsProto("expected continuation frame".to_owned()));
            }
            total += next.len;
            fin = next.fin;
        }
        Ok(Some((first.opcode, total)))
    }
}
