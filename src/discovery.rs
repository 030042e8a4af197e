use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::NdtError;
use crate::settings::{NettestFlags, ProtocolFlags, Settings};

/// Minimal HTTP GET seam: the orchestrator only ever needs one JSON
/// document from the location service.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, NdtError>;
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Production fetcher backed by reqwest.
#[derive(Default)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new() -> ReqwestFetch {
        ReqwestFetch { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, NdtError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| NdtError::Discovery(format!("GET {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| NdtError::Discovery(format!("cannot read response body: {}", e)))?;
        Ok(HttpResponse { status, body })
    }
}

/// The service URL for the current settings: base, protocol-dependent
/// suffix, optional policy selector.
pub(crate) fn discovery_url(settings: &Settings) -> String {
    let suffix = if settings.nettest_flags.contains(NettestFlags::DOWNLOAD_EXT) {
        "neubot"
    } else if settings.protocol_flags.contains(ProtocolFlags::NDT7) {
        "ndt7"
    } else if settings.protocol_flags.contains(ProtocolFlags::TLS) {
        "ndt_ssl"
    } else {
        "ndt"
    };
    let mut url = format!("{}/{}", settings.mlabns_base_url.trim_end_matches('/'), suffix);
    if let Some(policy) = settings.mlabns_policy.query_value() {
        url.push_str("?policy=");
        url.push_str(policy);
    }
    url
}

/// Candidate hostnames in server-preference order. A single-object
/// response counts as a one-element list; every entry must carry an
/// `fqdn`.
pub(crate) async fn discover(
    settings: &Settings,
    fetch: &dyn HttpFetch,
) -> Result<Vec<String>, NdtError> {
    let url = discovery_url(settings);
    debug!("querying location service: {}", url);

    let response = fetch.get(&url, settings.io_timeout).await?;
    match response.status {
        200 => {}
        204 => return Err(NdtError::Discovery("location service is out of capacity".to_owned())),
        status => {
            return Err(NdtError::Discovery(format!(
                "location service returned status {}",
                status
            )))
        }
    }

    let document: Value = serde_json::from_str(&response.body)
        .map_err(|e| NdtError::Discovery(format!("cannot parse JSON: {}", e)))?;
    let entries = match document {
        Value::Array(entries) => entries,
        object @ Value::Object(_) => vec![object],
        _ => return Err(NdtError::Discovery("unexpected JSON shape".to_owned())),
    };

    let mut hostnames = Vec::with_capacity(entries.len());
    for entry in &entries {
        let fqdn = entry
            .get("fqdn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NdtError::Discovery("server entry has no fqdn field".to_owned()))?;
        hostnames.push(fqdn.to_owned());
    }
    if hostnames.is_empty() {
        return Err(NdtError::Discovery("location service returned no servers".to_owned()));
    }

    info!("discovered {} candidate server(s)", hostnames.len());
    Ok(hostnames)
}
