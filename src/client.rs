use std::sync::Arc;

use tracing::{debug, info};

use crate::discovery::{self, HttpFetch, ReqwestFetch};
use crate::errors::NdtError;
use crate::events::{EventHandler, Events, LogHandler};
use crate::ndt5::{self, AttemptError};
use crate::ndt7;
use crate::settings::{NettestFlags, ProtocolFlags, Settings};

/// NDT client. Construct one with the desired settings and call
/// [`Client::run`]; progress and results arrive through the
/// [`EventHandler`].
pub struct Client {
    settings: Settings,
    events: Events,
    fetch: Arc<dyn HttpFetch>,
}

impl Client {
    pub fn new(settings: Settings) -> Client {
        Client::with_handler(settings, Arc::new(LogHandler))
    }

    pub fn with_handler(settings: Settings, handler: Arc<dyn EventHandler>) -> Client {
        Client::with_parts(settings, handler, Arc::new(ReqwestFetch::new()))
    }

    /// Full dependency injection, mainly for embedders that bring their
    /// own HTTP client.
    pub fn with_parts(
        settings: Settings,
        handler: Arc<dyn EventHandler>,
        fetch: Arc<dyn HttpFetch>,
    ) -> Client {
        Client { settings, events: handler, fetch }
    }

    /// Run one complete test: discover candidates (unless a hostname is
    /// configured), then work through them until a measurement succeeds.
    pub async fn run(&mut self) -> bool {
        self.settings.normalize();

        let candidates = match self.candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.events.on_warning(&format!("{}", e));
                return false;
            }
        };

        for candidate in candidates {
            info!("trying candidate server {}", candidate);
            self.settings.hostname = candidate;

            if self.settings.protocol_flags.contains(ProtocolFlags::NDT7) {
                // only the first candidate is measured with ndt7
                return self.run_ndt7().await;
            }

            match ndt5::run(&self.settings, &self.events).await {
                Ok(()) => return true,
                Err(AttemptError::Busy(_)) => {
                    // reported through on_server_busy already
                    continue;
                }
                Err(AttemptError::Setup(e)) => {
                    self.events.on_warning(&format!(
                        "cannot set up connection to {}: {}",
                        self.settings.hostname, e
                    ));
                    continue;
                }
                Err(AttemptError::Fatal(e)) => {
                    self.events.on_warning(&format!("test failed: {}", e));
                    return false;
                }
            }
        }

        self.events.on_warning("no candidate server worked");
        false
    }

    /// ndt7 sub-tests fail soft: a broken direction is a warning, not a
    /// failed measurement.
    async fn run_ndt7(&self) -> bool {
        if self.settings.nettest_flags.contains(NettestFlags::DOWNLOAD) {
            if let Err(e) = ndt7::run_download(&self.settings, &self.events).await {
                self.events.on_warning(&format!("ndt7 download failed: {}", e));
            }
        }
        if self.settings.nettest_flags.contains(NettestFlags::UPLOAD) {
            if let Err(e) = ndt7::run_upload(&self.settings, &self.events).await {
                self.events.on_warning(&format!("ndt7 upload failed: {}", e));
            }
        }
        true
    }

    async fn candidates(&self) -> Result<Vec<String>, NdtError> {
        if !self.settings.hostname.is_empty() {
            debug!("skipping discovery, hostname is configured");
            return Ok(vec![self.settings.hostname.clone()]);
        }
        discovery::discover(&self.settings, self.fetch.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{HttpResponse, MockHttpFetch};
    use crate::ndt5::messages::{
        MSG_KICKOFF, MSG_LOGIN, MSG_LOGOUT, MSG_RESULTS, MSG_SRV_QUEUE, MSG_TEST_FINALIZE,
        MSG_TEST_MSG, MSG_TEST_PREPARE, MSG_TEST_START,
    };
    use crate::test_util::RecordingHandler;
    use std::time::Duration;
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

    /// A meta-only session: grant just the META sub-test and log out.
    async fn serve_meta_only(control: &mut TcpStream) {
        let _ = read_msg(control).await;
        control.write_all(MSG_KICKOFF).await.unwrap();
        write_msg(control, MSG_SRV_QUEUE, b"0").await;
        write_msg(control, MSG_LOGIN, b"v3.7.0-server").await;
        write_msg(control, MSG_LOGIN, b"32").await;
        write_msg(control, MSG_TEST_PREPARE, b"").await;
        write_msg(control, MSG_TEST_START, b"").await;
        loop {
            let (code, body) = read_msg(control).await;
            assert_eq!(code, MSG_TEST_MSG);
            if body.is_empty() {
                break;
            }
        }
        write_msg(control, MSG_TEST_FINALIZE, b"").await;
        write_msg(control, MSG_RESULTS, b"outcome: fine\n").await;
        write_msg(control, MSG_LOGOUT, b"").await;
    }

    #[tokio::test]
    async fn test_run_with_configured_hostname() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            serve_meta_only(&mut control).await;
        });

        let handler = Arc::new(RecordingHandler::default());
        let mut settings = Settings::default();
        settings.hostname = "127.0.0.1".to_owned();
        settings.port = Some(port);
        let mut fetch = MockHttpFetch::new();
        fetch.expect_get().never();

        let mut client = Client::with_parts(settings, handler.clone(), Arc::new(fetch));
        assert!(client.run().await);
        server.await.unwrap();

        assert_eq!(
            handler.results(),
            vec![("summary".to_owned(), "outcome".to_owned(), "fine".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_run_moves_past_busy_candidate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // first candidate: busy
            let (mut control, _) = listener.accept().await.unwrap();
            let _ = read_msg(&mut control).await;
            control.write_all(MSG_KICKOFF).await.unwrap();
            write_msg(&mut control, MSG_SRV_QUEUE, b"9990").await;
            drop(control);

            // second candidate: full session
            let (mut control, _) = listener.accept().await.unwrap();
            serve_meta_only(&mut control).await;
        });

        let handler = Arc::new(RecordingHandler::default());
        let mut settings = Settings::default();
        settings.port = Some(port);

        let mut fetch = MockHttpFetch::new();
        let response = HttpResponse {
            status: 200,
            body: r#"[{"fqdn":"127.0.0.1"},{"fqdn":"127.0.0.1"}]"#.to_owned(),
        };
        fetch.expect_get().times(1).returning(move |_, _| Ok(response.clone()));

        let mut client = Client::with_parts(settings, handler.clone(), Arc::new(fetch));
        assert!(client.run().await);
        server.await.unwrap();

        assert_eq!(handler.busy_messages(), vec!["9990".to_owned()]);
        assert!(!handler.results().is_empty());
    }

    #[tokio::test]
    async fn test_run_fails_when_discovery_fails() {
        let handler = Arc::new(RecordingHandler::default());
        let mut fetch = MockHttpFetch::new();
        fetch
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(HttpResponse { status: 204, body: String::new() }));

        let mut client = Client::with_parts(Settings::default(), handler.clone(), Arc::new(fetch));
        assert!(!client.run().await);
        assert!(!handler.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_run_exhausts_unreachable_candidates() {
        // a freshly bound-then-dropped port refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handler = Arc::new(RecordingHandler::default());
        let mut settings = Settings::default();
        settings.port = Some(port);
        settings.io_timeout = Duration::from_secs(2);

        let mut fetch = MockHttpFetch::new();
        let response = HttpResponse {
            status: 200,
            body: r#"[{"fqdn":"127.0.0.1"},{"fqdn":"127.0.0.1"}]"#.to_owned(),
        };
        fetch.expect_get().times(1).returning(move |_, _| Ok(response.clone()));

        let mut client = Client::with_parts(settings, handler.clone(), Arc::new(fetch));
        assert!(!client.run().await);
        // one setup warning per candidate plus the final verdict
        assert!(handler.warnings().len() >= 3);
    }
}
