//! Shared helpers for the in-crate test suites.

use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::events::EventHandler;
use crate::transport::dialer::NdtStream;
use crate::transport::Connection;
use crate::ws::frame::{apply_mask, extended_len_bytes, parse_extended_len, parse_first_bytes};
use crate::ws::handshake::accept_for_key;
use crate::ws::stream::WsStream;

/// Handler that records every callback for later assertions.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub warnings: Mutex<Vec<String>>,
    pub results: Mutex<Vec<(String, String, String)>>,
    pub busy: Mutex<Vec<String>>,
    pub samples: Mutex<Vec<(u8, u8, u64)>>,
}

impl RecordingHandler {
    pub(crate) fn results(&self) -> Vec<(String, String, String)> {
        self.results.lock().unwrap().clone()
    }

    pub(crate) fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    pub(crate) fn busy_messages(&self) -> Vec<String> {
        self.busy.lock().unwrap().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn on_warning(&self, msg: &str) {
        self.warnings.lock().unwrap().push(msg.to_owned());
    }

    fn on_info(&self, _msg: &str) {}

    fn on_debug(&self, _msg: &str) {}

    fn on_performance(&self, test_id: u8, nflows: u8, total_bytes: u64, _elapsed: f64, _max_runtime: f64) {
        self.samples.lock().unwrap().push((test_id, nflows, total_bytes));
    }

    fn on_result(&self, scope: &str, name: &str, value: &str) {
        self.results
            .lock()
            .unwrap()
            .push((scope.to_owned(), name.to_owned(), value.to_owned()));
    }

    fn on_server_busy(&self, msg: &str) {
        self.busy.lock().unwrap().push(msg.to_owned());
    }
}

/// An in-memory plain control stream plus the far end of the pipe.
pub(crate) fn plain_pair() -> (NdtStream, DuplexStream) {
    let (near, far) = tokio::io::duplex(1 << 20);
    let conn = Connection::new(Box::new(near), None, Duration::from_secs(7));
    (NdtStream::Plain(conn), far)
}

/// An in-memory WebSocket stream (handshake skipped) plus the far end.
pub(crate) fn ws_pair() -> (NdtStream, DuplexStream) {
    let (near, far) = tokio::io::duplex(1 << 20);
    let conn = Connection::new(Box::new(near), None, Duration::from_secs(7));
    (NdtStream::Ws(WsStream::new(conn)), far)
}

/// An unmasked frame the way a server would send it.
pub(crate) fn server_ws_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![if fin { 0x80 } else { 0x00 } | opcode];
    let len = payload.len();
    if len < 126 {
        buf.push(len as u8);
    } else if len <= 0xFFFF {
        buf.push(126);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Act as the server side of a WebSocket upgrade: consume the request,
/// echo the subprotocol and answer with the accept value derived from
/// the client's key.
pub(crate) async fn ws_server_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    subprotocol: &str,
) {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        request.push(byte[0]);
    }
    let request = String::from_utf8(request).unwrap();
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("upgrade request has no key");

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: {}\r\n\
         \r\n",
        accept_for_key(key),
        subprotocol,
    );
    stream.write_all(response.as_bytes()).await.unwrap();
}

/// Parse one masked client frame off the far end of a pipe, returning
/// (fin, opcode, unmasked payload).
pub(crate) async fn read_client_ws_frame<S: AsyncRead + Unpin>(far: &mut S) -> (bool, u8, Vec<u8>) {
    let mut head = [0u8; 2];
    far.read_exact(&mut head).await.unwrap();
    let partial = parse_first_bytes(head[0], head[1]).unwrap();
    assert!(partial.masked, "client frames must be masked");
    let ext_len = extended_len_bytes(partial.len7);
    let mut ext = [0u8; 8];
    far.read_exact(&mut ext[..ext_len]).await.unwrap();
    let len = parse_extended_len(partial.len7, &ext[..ext_len]).unwrap() as usize;
    let mut mask_key = [0u8; 4];
    far.read_exact(&mut mask_key).await.unwrap();
    let mut payload = vec![0u8; len];
    far.read_exact(&mut payload).await.unwrap();
    apply_mask(&mut payload, mask_key);
    (partial.fin, partial.opcode, payload)
}
