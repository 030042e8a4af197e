use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::NdtError;
use crate::settings::Settings;

use super::BoxConn;

/// Well-known bundle locations probed when no explicit path is given.
const CA_BUNDLE_CANDIDATES: [&str; 2] = [
    "/etc/ssl/cert.pem",
    "/etc/ssl/certs/ca-certificates.crt",
];

/// Wrap an established stream in TLS, verifying the certificate chain
/// and `hostname` unless the settings explicitly opt out. The handshake
/// is bounded by `io_timeout`.
pub(crate) async fn wrap(conn: BoxConn, hostname: &str, settings: &Settings) -> Result<BoxConn, NdtError> {
    let config = client_config(settings)?;
    let server_name = ServerName::try_from(hostname.to_owned())
        .map_err(|e| NdtError::Tls(format!("invalid server name {:?}: {}", hostname, e)))?;
    let connector = TlsConnector::from(config);
    match timeout(settings.io_timeout, connector.connect(server_name, conn)).await {
        Ok(Ok(stream)) => Ok(Box::new(stream)),
        Ok(Err(e)) => Err(NdtError::Tls(format!("handshake with {} failed: {}", hostname, e))),
        Err(_) => Err(NdtError::Timeout),
    }
}

fn client_config(settings: &Settings) -> Result<Arc<ClientConfig>, NdtError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| NdtError::Tls(e.to_string()))?;

    let config = if settings.verify_peer {
        builder
            .with_root_certificates(load_roots(settings.ca_bundle_path.as_deref())?)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

fn load_roots(explicit: Option<&Path>) -> Result<RootCertStore, NdtError> {
    let path = locate_ca_bundle(explicit)?;
    let mut reader = BufReader::new(File::open(&path)?);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert?;
        roots
            .add(cert)
            .map_err(|e| NdtError::Tls(format!("bad certificate in {}: {}", path.display(), e)))?;
    }
    if roots.is_empty() {
        return Err(NdtError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(roots)
}

fn locate_ca_bundle(explicit: Option<&Path>) -> Result<PathBuf, NdtError> {
    if let Some(path) = explicit {
        return Ok(path.to_owned());
    }
    for candidate in CA_BUNDLE_CANDIDATES {
        if Path::new(candidate).exists() {
            debug!("using CA bundle {}", candidate);
            return Ok(PathBuf::from(candidate));
        }
    }
    Err(NdtError::Tls(
        "no CA bundle found; set ca_bundle_path or disable peer verification".to_owned(),
    ))
}

/// Verifier installed when the embedder explicitly disabled peer
/// verification.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
