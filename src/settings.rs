use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::path::PathBuf;
use std::time::Duration;

/// Highest NDT control-protocol version this client speaks.
pub const NDT_VERSION_COMPAT: &str = "v3.7.0";

/// Which sub-tests to request from the server. The numeric values are
/// the ones the login message carries on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NettestFlags(pub u8);

impl NettestFlags {
    pub const MIDDLEBOX: NettestFlags = NettestFlags(1 << 0);
    pub const UPLOAD: NettestFlags = NettestFlags(1 << 1);
    pub const DOWNLOAD: NettestFlags = NettestFlags(1 << 2);
    pub const SIMPLE_FIREWALL: NettestFlags = NettestFlags(1 << 3);
    pub const STATUS: NettestFlags = NettestFlags(1 << 4);
    pub const META: NettestFlags = NettestFlags(1 << 5);
    pub const UPLOAD_EXT: NettestFlags = NettestFlags(1 << 6);
    pub const DOWNLOAD_EXT: NettestFlags = NettestFlags(1 << 7);

    pub fn contains(self, other: NettestFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for NettestFlags {
    type Output = NettestFlags;
    fn bitor(self, rhs: NettestFlags) -> NettestFlags {
        NettestFlags(self.0 | rhs.0)
    }
}
impl BitOrAssign for NettestFlags {
    fn bitor_assign(&mut self, rhs: NettestFlags) {
        self.0 |= rhs.0;
    }
}
impl BitAnd for NettestFlags {
    type Output = NettestFlags;
    fn bitand(self, rhs: NettestFlags) -> NettestFlags {
        NettestFlags(self.0 & rhs.0)
    }
}
impl Not for NettestFlags {
    type Output = NettestFlags;
    fn not(self) -> NettestFlags {
        NettestFlags(!self.0)
    }
}

/// Which wire dialects to use on the control and measurement channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolFlags(pub u32);

impl ProtocolFlags {
    /// Message bodies are JSON objects rather than raw strings.
    pub const JSON: ProtocolFlags = ProtocolFlags(1 << 0);
    /// All channels run over TLS.
    pub const TLS: ProtocolFlags = ProtocolFlags(1 << 1);
    /// All channels use WebSocket framing.
    pub const WEBSOCKET: ProtocolFlags = ProtocolFlags(1 << 2);
    /// Speak ndt7 instead of the legacy protocol. Implies WEBSOCKET|TLS.
    pub const NDT7: ProtocolFlags = ProtocolFlags(1 << 3);

    pub fn contains(self, other: ProtocolFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: ProtocolFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for ProtocolFlags {
    type Output = ProtocolFlags;
    fn bitor(self, rhs: ProtocolFlags) -> ProtocolFlags {
        ProtocolFlags(self.0 | rhs.0)
    }
}
impl BitOrAssign for ProtocolFlags {
    fn bitor_assign(&mut self, rhs: ProtocolFlags) {
        self.0 |= rhs.0;
    }
}

/// Server-selection policy understood by the location service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MlabnsPolicy {
    /// The geographically closest server (the service's default).
    #[default]
    Closest,
    /// A random nearby server.
    Random,
    /// An ordered list of candidates to try in sequence.
    GeoOptions,
}

impl MlabnsPolicy {
    pub(crate) fn query_value(self) -> Option<&'static str> {
        match self {
            MlabnsPolicy::Closest => None,
            MlabnsPolicy::Random => Some("random"),
            MlabnsPolicy::GeoOptions => Some("geo_options"),
        }
    }
}

/// Run configuration. Consumed when the client is constructed; the
/// orchestrator adjusts `hostname` and the flag fields between steps
/// (adopting a discovered server, applying flag implications).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the location service used when `hostname` is empty.
    pub mlabns_base_url: String,
    pub mlabns_policy: MlabnsPolicy,
    /// NDT server to measure against; empty means "discover one".
    pub hostname: String,
    /// Control port override. The default depends on the dialect:
    /// 3001 (plain ndt5), 3010 (ndt5 over TLS), 443 (ndt7).
    pub port: Option<u16>,
    pub nettest_flags: NettestFlags,
    pub protocol_flags: ProtocolFlags,
    /// Bound on every single socket operation.
    pub io_timeout: Duration,
    /// Bound on every sub-test as a whole.
    pub max_runtime: Duration,
    /// Key/value pairs submitted during the META sub-test, in order.
    pub metadata: Vec<(String, String)>,
    /// When set, tunnel everything through a SOCKS5h proxy at
    /// 127.0.0.1:port (hostname resolution is delegated to the proxy).
    pub socks5h_port: Option<u16>,
    /// CA bundle for TLS; well-known OS paths are probed when unset.
    pub ca_bundle_path: Option<PathBuf>,
    /// Disabling this skips all TLS peer validation. Testing only.
    pub verify_peer: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            mlabns_base_url: "https://mlab-ns.appspot.com".to_owned(),
            mlabns_policy: MlabnsPolicy::Closest,
            hostname: String::new(),
            port: None,
            nettest_flags: NettestFlags::DOWNLOAD,
            protocol_flags: ProtocolFlags::default(),
            io_timeout: Duration::from_secs(7),
            max_runtime: Duration::from_secs(14),
            metadata: vec![
                ("client.version".to_owned(), NDT_VERSION_COMPAT.to_owned()),
                ("client.application".to_owned(), "ndt-client".to_owned()),
            ],
            socks5h_port: None,
            ca_bundle_path: None,
            verify_peer: true,
        }
    }
}

impl Settings {
    /// Apply the flag implications before a run: ndt7 pulls in WebSocket
    /// and TLS; the multi-stream download only exists in the JSON dialect
    /// over a plain socket.
    pub(crate) fn normalize(&mut self) {
        if self.protocol_flags.contains(ProtocolFlags::NDT7) {
            self.protocol_flags |= ProtocolFlags::WEBSOCKET | ProtocolFlags::TLS;
        }
        if self.nettest_flags.contains(NettestFlags::DOWNLOAD_EXT) {
            self.protocol_flags |= ProtocolFlags::JSON;
            self.protocol_flags
                .remove(ProtocolFlags::TLS | ProtocolFlags::WEBSOCKET);
        }
    }

    /// The ndt5 control port for the current flags.
    pub(crate) fn control_port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.protocol_flags.contains(ProtocolFlags::TLS) => 3010,
            None => 3001,
        }
    }
}
