pub mod client;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod settings;

pub(crate) mod ndt5;
pub(crate) mod ndt7;
pub(crate) mod transport;
pub(crate) mod util;
pub(crate) mod ws;

pub use client::Client;
pub use errors::{NdtError, Socks5Error};
pub use events::{EventHandler, LogHandler};
pub use settings::{MlabnsPolicy, NettestFlags, ProtocolFlags, Settings};

#[cfg(test)]
pub(crate) mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
