pub(crate) mod control;
pub(crate) mod download;
pub(crate) mod messages;
pub(crate) mod meta;
pub(crate) mod upload;

use std::time::Duration;

use tracing::info;

use crate::errors::NdtError;
use crate::events::Events;
use crate::settings::{ProtocolFlags, Settings};
use crate::transport::dialer::{self, WsConfig};

use self::control::QueueDecision;
use self::messages::ControlConn;

/// Sub-test ids the server may grant. Same numeric values as the login
/// request flags.
pub(crate) const TEST_UPLOAD: u16 = 2;
pub(crate) const TEST_DOWNLOAD: u16 = 4;
pub(crate) const TEST_META: u16 = 32;
pub(crate) const TEST_DOWNLOAD_EXT: u16 = 128;

pub(crate) const WS_PATH: &str = "/ndt_protocol";
pub(crate) const WS_PROTO_CONTROL: &str = "ndt";
pub(crate) const WS_PROTO_DOWNLOAD: &str = "s2c";
pub(crate) const WS_PROTO_UPLOAD: &str = "c2s";

/// Receive/send buffer for the throughput sub-tests.
pub(crate) const MEASUREMENT_BUFFER_SIZE: usize = 1 << 17;

/// Cadence of the progress samples.
pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Why an attempt against one candidate server ended without a result.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// The server turned us away at the queue; try the next candidate.
    Busy(String),
    /// Connection setup failed before queue admission; try the next
    /// candidate.
    Setup(NdtError),
    /// The test itself failed; the whole run is over.
    Fatal(NdtError),
}

/// Run the complete legacy pipeline against the configured server.
pub(crate) async fn run(settings: &Settings, events: &Events) -> Result<(), AttemptError> {
    let port = settings.control_port();
    let ws = settings
        .protocol_flags
        .contains(ProtocolFlags::WEBSOCKET)
        .then_some(WsConfig { path: WS_PATH, subprotocol: WS_PROTO_CONTROL });

    let stream = dialer::dial(settings, &settings.hostname, port, ws)
        .await
        .map_err(AttemptError::Setup)?;
    let mut conn = ControlConn::new(stream, settings.protocol_flags.contains(ProtocolFlags::JSON));
    events.on_info("connected to remote host");

    control::send_login(&mut conn, settings, events)
        .await
        .map_err(AttemptError::Setup)?;
    events.on_info("sent login message");

    control::recv_kickoff(&mut conn).await.map_err(AttemptError::Setup)?;
    events.on_info("received kickoff message");

    match control::wait_in_queue(&mut conn).await.map_err(AttemptError::Setup)? {
        QueueDecision::Busy(msg) => {
            events.on_server_busy(&msg);
            return Err(AttemptError::Busy(msg));
        }
        QueueDecision::Admitted => {}
    }
    events.on_info("authorized to run test");

    // past queue admission, every failure is fatal for the whole run
    control::recv_version(&mut conn, events)
        .await
        .map_err(AttemptError::Fatal)?;
    let suite = control::recv_tests_ids(&mut conn).await.map_err(AttemptError::Fatal)?;
    events.on_info("received tests ids");

    run_tests(&mut conn, &suite, settings, events)
        .await
        .map_err(AttemptError::Fatal)?;
    events.on_info("finished running tests; now reading summary data");

    control::recv_results_and_logout(&mut conn, events)
        .await
        .map_err(AttemptError::Fatal)?;
    events.on_info("received logout message");

    control::wait_close(conn).await;
    events.on_info("connection closed");
    Ok(())
}

/// Dispatch the granted suite in the order the server announced it.
async fn run_tests(
    conn: &mut ControlConn,
    suite: &[u16],
    settings: &Settings,
    events: &Events,
) -> Result<(), NdtError> {
    for &test_id in suite {
        match test_id {
            TEST_UPLOAD => {
                info!("running upload test");
                upload::run(conn, settings, events).await?;
            }
            TEST_META => {
                // not worth the user's attention
                events.on_debug("running meta test");
                meta::run(conn, settings).await?;
            }
            TEST_DOWNLOAD | TEST_DOWNLOAD_EXT => {
                info!("running download test");
                download::run(conn, settings, events).await?;
            }
            other => {
                return Err(NdtError::Protocol(format!("server granted unknown test id {}", other)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::NettestFlags;
    use crate::test_util::{
        read_client_ws_frame, server_ws_frame, ws_server_handshake, RecordingHandler,
    };
    use crate::ws::frame::OP_BINARY;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn write_msg(stream: &mut TcpStream, code: u8, body: &[u8]) {
        let mut wire = vec![code, (body.len() >> 8) as u8, body.len() as u8];
        wire.extend_from_slice(body);
        stream.write_all(&wire).await.unwrap();
    }

    async fn read_msg(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await.unwrap();
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (header[0], body)
    }

    fn quick_settings(port: u16) -> Settings {
        let mut settings = Settings::default();
        settings.hostname = "127.0.0.1".to_owned();
        settings.port = Some(port);
        settings.max_runtime = Duration::from_millis(500);
        settings
    }

    fn events() -> (Arc<RecordingHandler>, Events) {
        let handler = Arc::new(RecordingHandler::default());
        let events: Events = handler.clone();
        (handler, events)
    }

    #[tokio::test]
    async fn test_full_plain_pipeline_download_upload_meta() {
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = control_listener.local_addr().unwrap().port();
        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = data_listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut control, _) = control_listener.accept().await.unwrap();

            let (code, body) = read_msg(&mut control).await;
            assert_eq!(code, messages::MSG_LOGIN);
            let suite = NettestFlags(body[0]);
            assert!(suite.contains(NettestFlags::DOWNLOAD));
            assert!(suite.contains(NettestFlags::UPLOAD));
            assert!(suite.contains(NettestFlags::STATUS));
            assert!(suite.contains(NettestFlags::META));

            control.write_all(messages::MSG_KICKOFF).await.unwrap();
            write_msg(&mut control, messages::MSG_SRV_QUEUE, b"0").await;
            write_msg(&mut control, messages::MSG_LOGIN, b"v3.7.0-server").await;
            write_msg(&mut control, messages::MSG_LOGIN, b"4 2 32").await;

            // download
            write_msg(&mut control, messages::MSG_TEST_PREPARE, data_port.to_string().as_bytes()).await;
            let (mut flow, _) = data_listener.accept().await.unwrap();
            write_msg(&mut control, messages::MSG_TEST_START, b"").await;
            flow.write_all(&vec![0x42; 200_000]).await.unwrap();
            drop(flow);
            write_msg(&mut control, messages::MSG_TEST_MSG, b"1600.0").await;
            let (code, speed) = read_msg(&mut control).await;
            assert_eq!(code, messages::MSG_TEST_MSG);
            assert!(!speed.is_empty());
            write_msg(&mut control, messages::MSG_TEST_MSG, b"CurMSS: 1460\nMaxRTT: 12\n").await;
            write_msg(&mut control, messages::MSG_TEST_FINALIZE, b"").await;

            // upload
            write_msg(&mut control, messages::MSG_TEST_PREPARE, data_port.to_string().as_bytes()).await;
            let (mut flow, _) = data_listener.accept().await.unwrap();
            write_msg(&mut control, messages::MSG_TEST_START, b"").await;
            let mut sink = vec![0u8; 1 << 16];
            let mut uploaded: u64 = 0;
            loop {
                match flow.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => uploaded += n as u64,
                }
            }
            assert!(uploaded > 0);
            write_msg(&mut control, messages::MSG_TEST_MSG, b"1234.5").await;
            write_msg(&mut control, messages::MSG_TEST_FINALIZE, b"").await;

            // meta
            write_msg(&mut control, messages::MSG_TEST_PREPARE, b"").await;
            write_msg(&mut control, messages::MSG_TEST_START, b"").await;
            let mut meta_entries = Vec::new();
            loop {
                let (code, body) = read_msg(&mut control).await;
                assert_eq!(code, messages::MSG_TEST_MSG);
                if body.is_empty() {
                    break;
                }
                meta_entries.push(String::from_utf8(body).unwrap());
            }
            assert!(meta_entries.iter().any(|e| e.starts_with("client.version:")));
            write_msg(&mut control, messages::MSG_TEST_FINALIZE, b"").await;

            // results
            write_msg(&mut control, messages::MSG_RESULTS, b"avg_speed: 1600\n").await;
            write_msg(&mut control, messages::MSG_LOGOUT, b"").await;
        });

        let (handler, events) = events();
        let mut settings = quick_settings(control_port);
        settings.nettest_flags = NettestFlags::DOWNLOAD | NettestFlags::UPLOAD;
        run(&settings, &events).await.unwrap();
        server.await.unwrap();

        let results = handler.results();
        assert!(results.contains(&("web100".to_owned(), "CurMSS".to_owned(), "1460".to_owned())));
        assert!(results.contains(&("web100".to_owned(), "MaxRTT".to_owned(), "12".to_owned())));
        assert!(results.contains(&("summary".to_owned(), "avg_speed".to_owned(), "1600".to_owned())));
        assert!(handler.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_busy_server_ends_attempt_without_fatal_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            let _ = read_msg(&mut control).await;
            control.write_all(messages::MSG_KICKOFF).await.unwrap();
            write_msg(&mut control, messages::MSG_SRV_QUEUE, b"9990").await;
        });

        let (handler, events) = events();
        let settings = quick_settings(port);
        let result = run(&settings, &events).await;
        assert!(matches!(result, Err(AttemptError::Busy(msg)) if msg == "9990"));
        assert_eq!(handler.busy_messages(), vec!["9990".to_owned()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_granted_test_id_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            let _ = read_msg(&mut control).await;
            control.write_all(messages::MSG_KICKOFF).await.unwrap();
            write_msg(&mut control, messages::MSG_SRV_QUEUE, b"0").await;
            write_msg(&mut control, messages::MSG_LOGIN, b"v3.7.0-server").await;
            write_msg(&mut control, messages::MSG_LOGIN, b"1").await;
        });

        let (_handler, events) = events();
        let settings = quick_settings(port);
        assert!(matches!(
            run(&settings, &events).await,
            Err(AttemptError::Fatal(_))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_websocket_pipeline_meta_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        async fn read_ndt_over_ws(stream: &mut TcpStream) -> (u8, Vec<u8>) {
            let (fin, opcode, header) = read_client_ws_frame(stream).await;
            assert_eq!(opcode, OP_BINARY);
            assert_eq!(header.len(), 3);
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            let body = if fin {
                assert_eq!(len, 0);
                Vec::new()
            } else {
                let (fin, _, body) = read_client_ws_frame(stream).await;
                assert!(fin);
                assert_eq!(body.len(), len);
                body
            };
            (header[0], body)
        }

        async fn write_ndt_over_ws(stream: &mut TcpStream, code: u8, body: &[u8]) {
            let mut payload = vec![code, (body.len() >> 8) as u8, body.len() as u8];
            payload.extend_from_slice(body);
            stream
                .write_all(&server_ws_frame(true, OP_BINARY, &payload))
                .await
                .unwrap();
        }

        let server = tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            ws_server_handshake(&mut control, "ndt").await;

            let (code, _) = read_ndt_over_ws(&mut control).await;
            assert_eq!(code, messages::MSG_LOGIN);

            // no kickoff in websocket mode
            write_ndt_over_ws(&mut control, messages::MSG_SRV_QUEUE, b"0").await;
            write_ndt_over_ws(&mut control, messages::MSG_LOGIN, b"v3.7.0-server").await;
            write_ndt_over_ws(&mut control, messages::MSG_LOGIN, b"32").await;

            write_ndt_over_ws(&mut control, messages::MSG_TEST_PREPARE, b"").await;
            write_ndt_over_ws(&mut control, messages::MSG_TEST_START, b"").await;
            loop {
                let (code, body) = read_ndt_over_ws(&mut control).await;
                assert_eq!(code, messages::MSG_TEST_MSG);
                if body.is_empty() {
                    break;
                }
            }
            write_ndt_over_ws(&mut control, messages::MSG_TEST_FINALIZE, b"").await;

            write_ndt_over_ws(&mut control, messages::MSG_RESULTS, b"granted: 32\n").await;
            write_ndt_over_ws(&mut control, messages::MSG_LOGOUT, b"").await;
        });

        let (handler, events) = events();
        let mut settings = quick_settings(port);
        settings.protocol_flags = ProtocolFlags::WEBSOCKET;
        run(&settings, &events).await.unwrap();
        server.await.unwrap();

        assert_eq!(
            handler.results(),
            vec![("summary".to_owned(), "granted".to_owned(), "32".to_owned())]
        );
    }
}
