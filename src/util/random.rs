use rand::{Rng, RngCore};

/// The alphabet used for measurement payloads. Printable ASCII only so
/// that packet captures stay readable.
const PRINTABLE: &[u8] = b" !\"#$%&'()*+,-./0123456789:;<=>?@\
ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

pub(crate) fn fill_printable(buf: &mut [u8]) {
    let mut rng = rand::rng();
    for b in buf.iter_mut() {
        *b = PRINTABLE[rng.random_range(0..PRINTABLE.len())];
    }
}

/// Fresh masking key for one client-sent WebSocket frame.
pub(crate) fn mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Fresh 16-byte nonce for one WebSocket upgrade request.
pub(crate) fn ws_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}
