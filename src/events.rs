use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callbacks through which the client reports progress and results to
/// the embedder. Implementations must be callable from any task; calls
/// happen both on the orchestrator and on measurement-flow tasks.
pub trait EventHandler: Send + Sync {
    fn on_warning(&self, msg: &str) {
        warn!("{}", msg);
    }

    fn on_info(&self, msg: &str) {
        info!("{}", msg);
    }

    fn on_debug(&self, msg: &str) {
        debug!("{}", msg);
    }

    /// Periodic progress sample. `test_id` is the wire value of the
    /// running sub-test, `nflows` the number of currently active
    /// measurement flows. `elapsed / max_runtime` is the completion
    /// fraction of the sub-test.
    fn on_performance(&self, test_id: u8, nflows: u8, total_bytes: u64, elapsed: f64, max_runtime: f64) {
        info!(
            "[{:3.0}%] elapsed: {:6.3} s; test_id: {} num_flows: {} speed: {:8.0} kbit/s",
            elapsed * 100.0 / max_runtime,
            elapsed,
            test_id,
            nflows,
            speed_kbits(total_bytes, elapsed),
        );
    }

    /// One measured variable. `scope` is `summary`, `web100` or `ndt7`.
    fn on_result(&self, scope: &str, name: &str, value: &str) {
        info!("  - [{}] {}: {}", scope, name, value);
    }

    fn on_server_busy(&self, msg: &str) {
        warn!("server is busy: {}", msg);
    }
}

/// Default handler: forwards everything to the `tracing` macros.
#[derive(Debug, Default)]
pub struct LogHandler;

impl EventHandler for LogHandler {}

pub(crate) type Events = Arc<dyn EventHandler>;

/// Client-side speed in kbit/s.
pub(crate) fn speed_kbits(bytes: u64, elapsed: f64) -> f64 {
    if elapsed > 0.0 {
        bytes as f64 * 8.0 / 1000.0 / elapsed
    } else {
        0.0
    }
}
