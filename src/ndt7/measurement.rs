use std::collections::BTreeMap;

use serde::Serialize;

/// Application-level counters carried in every client measurement.
#[derive(Debug, Serialize)]
pub(crate) struct AppInfo {
    /// Microseconds since the sub-test began.
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
    #[serde(rename = "NumBytes")]
    pub num_bytes: i64,
}

/// One in-band measurement message, sent as a text frame during upload.
#[derive(Debug, Serialize)]
pub(crate) struct Measurement {
    #[serde(rename = "AppInfo")]
    pub app_info: AppInfo,
    #[serde(rename = "TCPInfo", skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<BTreeMap<&'static str, i64>>,
}
