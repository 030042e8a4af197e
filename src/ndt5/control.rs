use tracing::debug;

use crate::errors::NdtError;
use crate::events::Events;
use crate::settings::{NettestFlags, Settings};
use crate::transport::dialer::NdtStream;

use super::messages::{
    emit_result_lines, ControlConn, MAX_LOOPS, MSG_KICKOFF, MSG_LOGIN, MSG_LOGOUT, MSG_RESULTS,
    MSG_SRV_QUEUE,
};

/// Outcome of the queue step: either we may proceed, or the server told
/// us to go away (which only ends this attempt, not the whole test).
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QueueDecision {
    Admitted,
    Busy(String),
}

/// Send the login message, stripping the sub-tests we cannot run and
/// adding the ones the protocol wants implied.
pub(crate) async fn send_login(
    conn: &mut ControlConn,
    settings: &Settings,
    events: &Events,
) -> Result<(), NdtError> {
    let mut suite = settings.nettest_flags | NettestFlags::STATUS | NettestFlags::META;
    for (flag, name) in [
        (NettestFlags::MIDDLEBOX, "middlebox"),
        (NettestFlags::SIMPLE_FIREWALL, "simple_firewall"),
        (NettestFlags::UPLOAD_EXT, "upload_ext"),
    ] {
        if suite.contains(flag) {
            events.on_warning(&format!("sub-test {} is not implemented, stripping it", name));
            suite = suite & !flag;
        }
    }
    conn.msg_write_login(suite.0).await
}

/// Expect the fixed 13-byte preamble. WebSocket servers do not send it.
pub(crate) async fn recv_kickoff(conn: &mut ControlConn) -> Result<(), NdtError> {
    let NdtStream::Plain(plain) = &mut conn.stream else {
        debug!("skipping kickoff in websocket mode");
        return Ok(());
    };
    let mut buf = [0u8; MSG_KICKOFF.len()];
    plain.recv_exact(&mut buf).await?;
    if buf != MSG_KICKOFF {
        return Err(NdtError::Protocol("invalid kickoff message".to_owned()));
    }
    Ok(())
}

/// A queue body of "0" admits us; anything else means the server is
/// busy and this attempt ends.
pub(crate) async fn wait_in_queue(conn: &mut ControlConn) -> Result<QueueDecision, NdtError> {
    let body = conn.msg_expect(MSG_SRV_QUEUE).await?;
    if body != "0" {
        return Ok(QueueDecision::Busy(body));
    }
    Ok(QueueDecision::Admitted)
}

/// The server announces its version; it is logged and otherwise ignored.
pub(crate) async fn recv_version(conn: &mut ControlConn, events: &Events) -> Result<(), NdtError> {
    let version = conn.msg_expect(MSG_LOGIN).await?;
    events.on_debug(&format!("server version: {}", version));
    Ok(())
}

/// The granted suite: space-separated sub-test ids, each in 1..=256,
/// order preserved.
pub(crate) async fn recv_tests_ids(conn: &mut ControlConn) -> Result<Vec<u16>, NdtError> {
    let body = conn.msg_expect(MSG_LOGIN).await?;
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut suite = Vec::new();
    for token in body.split(' ') {
        let id = token
            .parse::<u16>()
            .ok()
            .filter(|id| (1..=256).contains(id))
            .ok_or_else(|| NdtError::Protocol(format!("invalid test id {:?}", token)))?;
        suite.push(id);
    }
    Ok(suite)
}

/// Collect the summary variables, then the logout.
pub(crate) async fn recv_results_and_logout(
    conn: &mut ControlConn,
    events: &Events,
) -> Result<(), NdtError> {
    for _ in 0..MAX_LOOPS {
        let (code, body) = conn.msg_read().await?;
        match code {
            MSG_LOGOUT => return Ok(()),
            MSG_RESULTS => emit_result_lines(events, "summary", &body)?,
            other => {
                return Err(NdtError::Protocol(format!(
                    "expected results or logout, got message type {}",
                    other
                )))
            }
        }
    }
    Err(NdtError::Protocol("too many results messages".to_owned()))
}

/// Give the server a bounded chance to close first, then drop the
/// control connection.
pub(crate) async fn wait_close(conn: ControlConn) {
    match conn.stream {
        NdtStream::Plain(plain) => plain.wait_close().await,
        NdtStream::Ws(ws) => ws.into_conn().wait_close().await,
    }
}
