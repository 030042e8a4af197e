use crate::errors::NdtError;
use crate::settings::Settings;

use super::messages::{ControlConn, MSG_TEST_FINALIZE, MSG_TEST_MSG, MSG_TEST_PREPARE, MSG_TEST_START};

/// The META sub-test: submit the configured key/value pairs, terminated
/// by an empty message.
pub(crate) async fn run(conn: &mut ControlConn, settings: &Settings) -> Result<(), NdtError> {
    conn.msg_expect_empty(MSG_TEST_PREPARE).await?;
    conn.msg_expect_empty(MSG_TEST_START).await?;

    for (key, value) in &settings.metadata {
        conn.msg_write(MSG_TEST_MSG, &format!("{}:{}", key, value)).await?;
    }
    conn.msg_write(MSG_TEST_MSG, "").await?;

    conn.msg_expect_empty(MSG_TEST_FINALIZE).await?;
    Ok(())
}
