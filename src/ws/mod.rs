pub(crate) mod frame;
pub(crate) mod handshake;
pub(crate) mod stream;
