use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant};
use tracing::debug;

use crate::errors::NdtError;
use crate::events::{speed_kbits, Events};
use crate::settings::{NettestFlags, ProtocolFlags, Settings};
use crate::transport::dialer::{self, NdtStream, WsConfig};
use crate::ws::frame;

use super::messages::{
    emit_result_lines, parse_test_prepare, ControlConn, MAX_LOOPS, MSG_TEST_FINALIZE, MSG_TEST_MSG,
    MSG_TEST_PREPARE, MSG_TEST_START,
};
use super::{MEASUREMENT_BUFFER_SIZE, SAMPLE_INTERVAL, WS_PATH, WS_PROTO_DOWNLOAD};

/// The S2C sub-test: the server announces a port and a flow count, we
/// open that many measurement connections and drain them in parallel
/// until the server stops or the runtime budget is spent.
pub(crate) async fn run(
    conn: &mut ControlConn,
    settings: &Settings,
    events: &Events,
) -> Result<(), NdtError> {
    let prepare = parse_test_prepare(&conn.msg_expect(MSG_TEST_PREPARE).await?)?;
    debug!("download: port {} flows {}", prepare.port, prepare.nflows);

    let mut flows = Vec::with_capacity(prepare.nflows as usize);
    for _ in 0..prepare.nflows {
        let ws = settings
            .protocol_flags
            .contains(ProtocolFlags::WEBSOCKET)
            .then_some(WsConfig { path: WS_PATH, subprotocol: WS_PROTO_DOWNLOAD });
        match dialer::dial(settings, &settings.hostname, prepare.port, ws).await {
            Ok(stream) => flows.push(stream),
            Err(e) => {
                events.on_warning(&format!("download: connect failed: {}", e));
                break;
            }
        }
    }
    if flows.len() != prepare.nflows as usize {
        return Err(NdtError::Protocol(
            "download: not every measurement flow connected".to_owned(),
        ));
    }

    conn.msg_expect_empty(MSG_TEST_START).await?;

    let total_bytes = Arc::new(AtomicU64::new(0));
    let active_flows = Arc::new(AtomicUsize::new(flows.len()));
    let begin = Instant::now();

    let mut receivers = Vec::with_capacity(flows.len());
    for stream in flows {
        let total_bytes = total_bytes.clone();
        let active_flows = active_flows.clone();
        let events = events.clone();
        let max_runtime = settings.max_runtime;
        receivers.push(tokio::spawn(async move {
            receive_flow(stream, &total_bytes, begin, max_runtime, &events).await;
            active_flows.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    let mut ticker = interval(SAMPLE_INTERVAL);
    ticker.tick().await; // the first tick fires immediately
    while active_flows.load(Ordering::SeqCst) > 0 {
        ticker.tick().await;
        events.on_performance(
            NettestFlags::DOWNLOAD.0,
            active_flows.load(Ordering::SeqCst) as u8,
            total_bytes.load(Ordering::SeqCst),
            begin.elapsed().as_secs_f64(),
            settings.max_runtime.as_secs_f64(),
        );
    }
    for receiver in receivers {
        let _ = receiver.await;
    }

    let client_speed = speed_kbits(total_bytes.load(Ordering::SeqCst), begin.elapsed().as_secs_f64());

    // the server's own estimate arrives with legacy framing even when
    // the JSON dialect is active
    let (code, body) = conn.msg_read_legacy().await?;
    if code != MSG_TEST_MSG {
        return Err(NdtError::Protocol(format!(
            "download: expected server speed, got message type {}",
            code
        )));
    }
    debug!("download: server computed speed: {:?}", String::from_utf8_lossy(&body));

    conn.msg_write(MSG_TEST_MSG, &format!("{}", client_speed)).await?;

    events.on_info("reading summary web100 variables");
    for _ in 0..MAX_LOOPS {
        let (code, body) = conn.msg_read().await?;
        match code {
            MSG_TEST_FINALIZE => return Ok(()),
            MSG_TEST_MSG => emit_result_lines(events, "web100", &body)?,
            other => {
                return Err(NdtError::Protocol(format!(
                    "download: unexpected message type {}",
                    other
                )))
            }
        }
    }
    Err(NdtError::Protocol("download: too many web100 messages".to_owned()))
}

/// Drain one measurement flow, adding everything read to the shared
/// counter. Ends on EOF, on error, or once the runtime budget is spent;
/// none of these fail the sub-test.
async fn receive_flow(
    stream: NdtStream,
    total: &AtomicU64,
    begin: Instant,
    max_runtime: Duration,
    events: &Events,
) {
    let mut buf = vec![0u8; MEASUREMENT_BUFFER_SIZE];
    match stream {
        NdtStream::Plain(mut conn) => loop {
            if begin.elapsed() > max_runtime {
                debug!("download flow: runtime budget spent");
                break;
            }
            match conn.recv(&mut buf).await {
                Ok(0) => {
                    debug!("download flow: EOF");
                    break;
                }
                Ok(n) => {
                    total.fetch_add(n as u64, Ordering::SeqCst);
                }
                Err(e) => {
                    events.on_warning(&format!("download flow: recv failed: {}", e));
                    break;
                }
            }
        },
        NdtStream::Ws(mut ws) => loop {
            if begin.elapsed() > max_runtime {
                debug!("download flow: runtime budget spent");
                break;
            }
            match ws.recv_message(&mut buf).await {
                Ok(None) => {
                    debug!("download flow: peer closed");
                    break;
                }
                Ok(Some((opcode, n))) => {
                    if opcode != frame::OP_BINARY {
                        events.on_warning("download flow: unexpected non-binary message");
                        break;
                    }
                    total.fetch_add(n as u64, Ordering::SeqCst);
                }
                Err(e) if e.is_eof() => {
                    debug!("download flow: EOF");
                    break;
                }
                Err(e) => {
                    events.on_warning(&format!("download flow: recv failed: {}", e));
                    break;
                }
            }
        },
    }
}
