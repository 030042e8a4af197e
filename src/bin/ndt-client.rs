use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use clap::Parser;
use clap_derive::Parser;
use rustc_hash::FxHashMap;
use tracing::Level;

use ndt_client::{Client, EventHandler, MlabnsPolicy, NettestFlags, ProtocolFlags, Settings};

#[derive(Parser, Debug)]
#[clap(name = "ndt-client", about = "Measure network throughput against an NDT server")]
struct Args {
    /// Run the download sub-test
    #[clap(long)]
    download: bool,

    /// Run the upload sub-test
    #[clap(long)]
    upload: bool,

    /// Run the multi-stream download sub-test
    #[clap(long)]
    download_ext: bool,

    /// Use the ndt7 protocol (implies WebSocket and TLS)
    #[clap(long)]
    ndt7: bool,

    /// Use the JSON message dialect
    #[clap(long)]
    json: bool,

    /// Secure all channels with TLS
    #[clap(long)]
    tls: bool,

    /// Use WebSocket framing
    #[clap(long)]
    websocket: bool,

    /// Pick a random nearby server instead of the closest one
    #[clap(long)]
    random: bool,

    /// Disable TLS peer verification (testing only)
    #[clap(long)]
    insecure: bool,

    /// Control port override
    #[clap(long)]
    port: Option<u16>,

    /// Tunnel through a SOCKS5h proxy at 127.0.0.1:<port>
    #[clap(long)]
    socks5h: Option<u16>,

    /// Path to a PEM CA bundle
    #[clap(long)]
    ca_bundle_path: Option<PathBuf>,

    /// Log debug messages too
    #[clap(short, long)]
    verbose: bool,

    /// NDT server to use; a nearby one is discovered when omitted
    hostname: Option<String>,
}

/// Logs everything and keeps the summary variables around for the final
/// report.
#[derive(Default)]
struct SummaryHandler {
    summary: Mutex<FxHashMap<String, String>>,
}

impl EventHandler for SummaryHandler {
    fn on_result(&self, scope: &str, name: &str, value: &str) {
        tracing::info!("  - [{}] {}: {}", scope, name, value);
        if scope == "summary" {
            self.summary
                .lock()
                .unwrap()
                .insert(name.to_owned(), value.to_owned());
        }
    }
}

fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();
}

fn settings_from(args: &Args) -> Settings {
    let mut settings = Settings::default();
    settings.nettest_flags = NettestFlags::default();
    if args.download {
        settings.nettest_flags |= NettestFlags::DOWNLOAD;
    }
    if args.upload {
        settings.nettest_flags |= NettestFlags::UPLOAD;
    }
    if args.download_ext {
        settings.nettest_flags |= NettestFlags::DOWNLOAD_EXT;
    }
    if args.json {
        settings.protocol_flags |= ProtocolFlags::JSON;
    }
    if args.tls {
        settings.protocol_flags |= ProtocolFlags::TLS;
    }
    if args.websocket {
        settings.protocol_flags |= ProtocolFlags::WEBSOCKET;
    }
    if args.ndt7 {
        settings.protocol_flags |= ProtocolFlags::NDT7;
    }
    if args.random {
        settings.mlabns_policy = MlabnsPolicy::Random;
    }
    if args.insecure {
        settings.verify_peer = false;
    }
    settings.port = args.port;
    settings.socks5h_port = args.socks5h;
    settings.ca_bundle_path = args.ca_bundle_path.clone();
    if let Some(hostname) = &args.hostname {
        settings.hostname = hostname.clone();
    }
    settings
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.hostname.is_none() {
        tracing::info!("no hostname given, will auto-select a server");
    }

    let handler = Arc::new(SummaryHandler::default());
    let mut client = Client::with_handler(settings_from(&args), handler.clone());
    let ok = client.run().await;

    let summary = handler.summary.lock().unwrap();
    if !summary.is_empty() {
        tracing::info!("summary variables:");
        let mut entries: Vec<_> = summary.iter().collect();
        entries.sort();
        for (name, value) in entries {
            tracing::info!("  {} = {}", name, value);
        }
    }

    if !ok {
        bail!("measurement failed");
    }
    Ok(())
}
