pub(crate) mod measurement;
pub(crate) mod tcpinfo;

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::errors::NdtError;
use crate::events::Events;
use crate::ndt5::SAMPLE_INTERVAL;
use crate::settings::{NettestFlags, Settings};
use crate::transport::dialer::{self, WsConfig};
use crate::util::random;
use crate::ws::frame;
use crate::ws::stream::MAX_MESSAGE_SIZE;

use self::measurement::{AppInfo, Measurement};

pub(crate) const WS_PROTOCOL: &str = "net.measurementlab.ndt.v7";
pub(crate) const DOWNLOAD_PATH: &str = "/ndt/v7/download";
pub(crate) const UPLOAD_PATH: &str = "/ndt/v7/upload";

const DEFAULT_PORT: u16 = 443;
/// The upload keeps pushing for this long, regardless of max_runtime.
const UPLOAD_DURATION: Duration = Duration::from_secs(10);
const UPLOAD_MESSAGE_SIZE: usize = 1 << 13;

/// Continuous download: binary messages are counted, text messages are
/// in-band measurements passed on to the collector.
pub(crate) async fn run_download(settings: &Settings, events: &Events) -> Result<(), NdtError> {
    let port = settings.port.unwrap_or(DEFAULT_PORT);
    let config = WsConfig { path: DOWNLOAD_PATH, subprotocol: WS_PROTOCOL };
    let mut ws = dialer::dial_ws(settings, &settings.hostname, port, config).await?;

    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let begin = Instant::now();
    let mut last_sample = begin;
    let mut total: u64 = 0;

    loop {
        if begin.elapsed() > settings.max_runtime {
            debug!("ndt7 download: runtime budget spent");
            break;
        }
        match ws.recv_message(&mut buf).await {
            Ok(None) => {
                debug!("ndt7 download: peer closed");
                break;
            }
            Ok(Some((opcode, n))) => {
                total += n as u64;
                if opcode == frame::OP_TEXT {
                    let Ok(text) = std::str::from_utf8(&buf[..n]) else {
                        events.on_warning("ndt7 download: measurement is not valid UTF-8");
                        break;
                    };
                    events.on_result("ndt7", "download", text);
                }
            }
            Err(e) if e.is_eof() => {
                debug!("ndt7 download: EOF");
                break;
            }
            Err(e) => {
                events.on_warning(&format!("ndt7 download: recv failed: {}", e));
                break;
            }
        }
        if last_sample.elapsed() >= SAMPLE_INTERVAL {
            events.on_performance(
                NettestFlags::DOWNLOAD.0,
                1,
                total,
                begin.elapsed().as_secs_f64(),
                settings.max_runtime.as_secs_f64(),
            );
            last_sample = Instant::now();
        }
    }
    Ok(())
}

/// Ten seconds of upload: one pre-masked binary frame resent in a tight
/// loop, interleaved every 250 ms with an in-band measurement carrying
/// our application-level counters (plus TCP_INFO where the OS offers
/// it).
pub(crate) async fn run_upload(settings: &Settings, events: &Events) -> Result<(), NdtError> {
    let port = settings.port.unwrap_or(DEFAULT_PORT);
    let config = WsConfig { path: UPLOAD_PATH, subprotocol: WS_PROTOCOL };
    let mut ws = dialer::dial_ws(settings, &settings.hostname, port, config).await?;

    let mut payload = vec![0u8; UPLOAD_MESSAGE_SIZE];
    random::fill_printable(&mut payload);
    let prebuilt = frame::build_frame(true, frame::OP_BINARY, random::mask_key(), &payload);

    let begin = Instant::now();
    let mut last_sample = begin;
    let mut total: u64 = 0;

    while begin.elapsed() < UPLOAD_DURATION {
        match ws.send_prebuilt(&prebuilt).await {
            Ok(()) => total += payload.len() as u64,
            Err(e) if e.is_broken_pipe() => {
                debug!("ndt7 upload: peer closed the stream");
                break;
            }
            Err(e) => {
                events.on_warning(&format!("ndt7 upload: send failed: {}", e));
                break;
            }
        }

        if last_sample.elapsed() >= SAMPLE_INTERVAL {
            let elapsed = begin.elapsed();
            let m = Measurement {
                app_info: AppInfo {
                    elapsed_time: elapsed.as_micros() as i64,
                    num_bytes: total as i64,
                },
                tcp_info: ws.raw_fd().and_then(tcpinfo::snapshot),
            };
            let rendered = serde_json::to_string(&m)
                .map_err(|e| NdtError::Protocol(format!("cannot serialize measurement: {}", e)))?;
            match ws.send_text(rendered.as_bytes()).await {
                Ok(()) => {}
                Err(e) if e.is_broken_pipe() => {
                    debug!("ndt7 upload: peer closed the stream");
                    break;
                }
                Err(e) => {
                    events.on_warning(&format!("ndt7 upload: send failed: {}", e));
                    break;
                }
            }
            events.on_result("ndt7", "upload", &rendered);
            events.on_performance(
                NettestFlags::UPLOAD.0,
                1,
                total,
                elapsed.as_secs_f64(),
                settings.max_runtime.as_secs_f64(),
            );
            last_sample = Instant::now();
        }
    }
    Ok(())
}
