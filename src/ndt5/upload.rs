use tokio::time::Instant;
use tracing::debug;

use crate::errors::NdtError;
use crate::events::{speed_kbits, Events};
use crate::settings::{NettestFlags, ProtocolFlags, Settings};
use crate::transport::dialer::{self, NdtStream, WsConfig};
use crate::util::random;
use crate::ws::frame;

use super::messages::{
    parse_test_prepare, ControlConn, MSG_TEST_FINALIZE, MSG_TEST_MSG, MSG_TEST_PREPARE,
    MSG_TEST_START,
};
use super::{MEASUREMENT_BUFFER_SIZE, SAMPLE_INTERVAL, WS_PATH, WS_PROTO_UPLOAD};

/// The C2S sub-test: a single measurement connection that we saturate
/// with a fixed random payload until the server stops reading or the
/// runtime budget is spent.
pub(crate) async fn run(
    conn: &mut ControlConn,
    settings: &Settings,
    events: &Events,
) -> Result<(), NdtError> {
    let prepare = parse_test_prepare(&conn.msg_expect(MSG_TEST_PREPARE).await?)?;
    if prepare.nflows != 1 {
        return Err(NdtError::Protocol(format!(
            "upload: unexpected flow count {}",
            prepare.nflows
        )));
    }

    let mut payload = vec![0u8; MEASUREMENT_BUFFER_SIZE];
    random::fill_printable(&mut payload);

    let ws = settings
        .protocol_flags
        .contains(ProtocolFlags::WEBSOCKET)
        .then_some(WsConfig { path: WS_PATH, subprotocol: WS_PROTO_UPLOAD });
    let stream = dialer::dial(settings, &settings.hostname, prepare.port, ws).await?;

    conn.msg_expect_empty(MSG_TEST_START).await?;

    let begin = Instant::now();
    let total = send_loop(stream, &payload, begin, settings, events).await;
    // the stream is gone at this point, so the server sees EOF and can
    // report its numbers

    let client_speed = speed_kbits(total, begin.elapsed().as_secs_f64());
    debug!("upload: client computed speed: {} kbit/s", client_speed);

    let body = conn.msg_expect(MSG_TEST_MSG).await?;
    debug!("upload: server computed speed: {:?}", body);

    conn.msg_expect_empty(MSG_TEST_FINALIZE).await?;
    Ok(())
}

/// Push the payload until the peer goes away or time is up; returns the
/// number of payload bytes sent. Consumes the stream so the socket is
/// closed when the loop ends.
async fn send_loop(
    stream: NdtStream,
    payload: &[u8],
    begin: Instant,
    settings: &Settings,
    events: &Events,
) -> u64 {
    let mut total: u64 = 0;
    let mut last_sample = begin;

    macro_rules! sample_tick {
        () => {
            if last_sample.elapsed() >= SAMPLE_INTERVAL {
                events.on_performance(
                    NettestFlags::UPLOAD.0,
                    1,
                    total,
                    begin.elapsed().as_secs_f64(),
                    settings.max_runtime.as_secs_f64(),
                );
                last_sample = Instant::now();
            }
        };
    }

    match stream {
        NdtStream::Plain(mut conn) => loop {
            if begin.elapsed() > settings.max_runtime {
                debug!("upload: runtime budget spent");
                break;
            }
            match conn.send_all(payload).await {
                Ok(()) => total += payload.len() as u64,
                Err(e) if e.is_broken_pipe() => {
                    debug!("upload: peer closed the stream");
                    break;
                }
                Err(e) => {
                    events.on_warning(&format!("upload: send failed: {}", e));
                    break;
                }
            }
            sample_tick!();
        },
        NdtStream::Ws(mut ws) => {
            // one masked frame, built once, resent every iteration
            let prebuilt = frame::build_frame(true, frame::OP_BINARY, random::mask_key(), payload);
            loop {
                if begin.elapsed() > settings.max_runtime {
                    debug!("upload: runtime budget spent");
                    break;
                }
                match ws.send_prebuilt(&prebuilt).await {
                    Ok(()) => total += payload.len() as u64,
                    Err(e) if e.is_broken_pipe() => {
                        debug!("upload: peer closed the stream");
                        break;
                    }
                    Err(e) => {
                        events.on_warning(&format!("upload: send failed: {}", e));
                        break;
                    }
                }
                sample_tick!();
            }
        }
    }
    total
}
