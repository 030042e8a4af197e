use bytes::{BufMut, BytesMut};

use crate::errors::NdtError;

pub(crate) const OP_CONTINUATION: u8 = 0x0;
pub(crate) const OP_TEXT: u8 = 0x1;
pub(crate) const OP_BINARY: u8 = 0x2;
pub(crate) const OP_CLOSE: u8 = 0x8;
pub(crate) const OP_PING: u8 = 0x9;
pub(crate) const OP_PONG: u8 = 0xA;

const FIN_BIT: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

pub(crate) fn is_control(opcode: u8) -> bool {
    opcode & 0x8 != 0
}

fn is_known(opcode: u8) -> bool {
    matches!(opcode, OP_CONTINUATION | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG)
}

/// The fixed two bytes of a frame header, decoded but with the payload
/// length still in its 7-bit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartialHead {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub len7: u8,
}

/// Serialize a complete client-side frame: header, mask key and the
/// payload XOR-ed with the key, in one contiguous buffer so the frame
/// leaves in a single write.
pub(crate) fn build_frame(fin: bool, opcode: u8, mask_key: [u8; 4], payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(14 + payload.len());
    buf.put_u8(if fin { FIN_BIT } else { 0 } | opcode);
    put_masked_len(&mut buf, payload.len() as u64);
    buf.put_slice(&mask_key);
    let payload_start = buf.len();
    buf.put_slice(payload);
    apply_mask(&mut buf[payload_start..], mask_key);
    buf
}

/// Length in 7/16/64-bit form, with the client-side mask bit set.
fn put_masked_len(buf: &mut BytesMut, len: u64) {
    if len < LEN_16 as u64 {
        buf.put_u8(MASK_BIT | len as u8);
    } else if len <= u16::MAX as u64 {
        buf.put_u8(MASK_BIT | LEN_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(MASK_BIT | LEN_64);
        buf.put_u64(len);
    }
}

pub(crate) fn apply_mask(data: &mut [u8], mask_key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask_key[i % 4];
    }
}

/// Decode the fixed two header bytes, rejecting reserved bits and
/// unknown opcodes.
pub(crate) fn parse_first_bytes(b0: u8, b1: u8) -> Result<PartialHead, NdtError> {
    if b0 & RSV_MASK != 0 {
        return Err(NdtError::WsProto("reserved bits set".to_owned()));
    }
    let opcode = b0 & 0x0F;
    if !is_known(opcode) {
        return Err(NdtError::WsProto(format!("unknown opcode {:#x}", opcode)));
    }
    Ok(PartialHead {
        fin: b0 & FIN_BIT != 0,
        opcode,
        masked: b1 & MASK_BIT != 0,
        len7: b1 & 0x7F,
    })
}

/// How many extended length bytes follow the fixed header.
pub(crate) fn extended_len_bytes(len7: u8) -> usize {
    match len7 {
        LEN_16 => 2,
        LEN_64 => 8,
        _ => 0,
    }
}

/// Decode the final payload length. The 64-bit form must have its most
/// significant bit clear.
pub(crate) fn parse_extended_len(len7: u8, ext: &[u8]) -> Result<u64, NdtError> {
    match len7 {
        LEN_16 => Ok(u16::from_be_bytes([ext[0], ext[1]]) as u64),
        LEN_64 => {
            let len = u64::from_be_bytes(ext.try_into().map_err(|_| {
                NdtError::WsProto("truncated 64-bit length".to_owned())
            })?);
            if len & (1 << 63) != 0 {
                return Err(NdtError::WsProto("64-bit length with MSB set".to_owned()));
            }
            Ok(len)
        }
        n => Ok(n as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use rstest::rstest;

    /// Decode a complete client frame built by `build_frame`, returning
    /// (head, payload length, unmasked payload).
    fn decode_client_frame(mut buf: &[u8]) -> (PartialHead, u64, Vec<u8>) {
        let head = parse_first_bytes(buf.get_u8(), buf.get_u8()).unwrap();
        assert!(head.masked);
        let ext = extended_len_bytes(head.len7);
        let len = parse_extended_len(head.len7, &buf[..ext]).unwrap();
        buf.advance(ext);
        let mut mask_key = [0u8; 4];
        buf.copy_to_slice(&mut mask_key);
        let mut payload = buf.to_vec();
        apply_mask(&mut payload, mask_key);
        (head, len, payload)
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(125)]
    #[case(126)]
    #[case(127)]
    #[case(65535)]
    #[case(65536)]
    #[case(1 << 32)]
    fn test_length_encoding_round_trip(#[case] len: u64) {
        let mut buf = BytesMut::new();
        put_masked_len(&mut buf, len);
        let len7 = buf[0] & 0x7F;
        assert_eq!(buf.len(), 1 + extended_len_bytes(len7));
        assert_eq!(parse_extended_len(len7, &buf[1..]).unwrap(), len);
    }

    #[test]
    fn test_length_encoding_forms() {
        for (len, expected_ext) in [(0u64, 0usize), (125, 0), (126, 2), (65535, 2), (65536, 8)] {
            let mut buf = BytesMut::new();
            put_masked_len(&mut buf, len);
            assert_eq!(buf.len() - 1, expected_ext, "len {}", len);
        }
    }

    #[test]
    fn test_64bit_length_msb_rejected() {
        let ext = (1u64 << 63).to_be_bytes();
        assert!(parse_extended_len(127, &ext).is_err());
        let ext = ((1u64 << 63) - 1).to_be_bytes();
        assert_eq!(parse_extended_len(127, &ext).unwrap(), (1 << 63) - 1);
    }

    #[rstest]
    #[case(&[] as &[u8])]
    #[case(b"x")]
    #[case(b"hello frame")]
    fn test_build_frame_round_trip(#[case] payload: &[u8]) {
        let frame = build_frame(true, OP_BINARY, [0xA1, 0xB2, 0xC3, 0xD4], payload);
        let (head, len, decoded) = decode_client_frame(&frame);
        assert!(head.fin);
        assert_eq!(head.opcode, OP_BINARY);
        assert_eq!(len as usize, payload.len());
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_build_frame_non_final() {
        let frame = build_frame(false, OP_CONTINUATION, [0; 4], b"part");
        let (head, _, _) = decode_client_frame(&frame);
        assert!(!head.fin);
        assert_eq!(head.opcode, OP_CONTINUATION);
    }

    #[test]
    fn test_masking_is_an_involution() {
        let original: Vec<u8> = (0u8..=255).collect();
        let key = [0x12, 0x34, 0x56, 0x78];
        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_reserved_bits_rejected() {
        for rsv in [0x10u8, 0x20, 0x40, 0x70] {
            assert!(parse_first_bytes(0x80 | rsv | OP_BINARY, 0x00).is_err());
        }
    }

    #[rstest]
    #[case(0x3)]
    #[case(0x7)]
    #[case(0xB)]
    #[case(0xF)]
    fn test_unknown_opcodes_rejected(#[case] opcode: u8) {
        assert!(parse_first_bytes(0x80 | opcode, 0x00).is_err());
    }

    #[test]
    fn test_mask_flag_decoded() {
        let head = parse_first_bytes(0x80 | OP_BINARY, 0x80 | 5).unwrap();
        assert!(head.masked);
        assert_eq!(head.len7, 5);

        let head = parse_first_bytes(0x80 | OP_BINARY, 5).unwrap();
        assert!(!head.masked);
    }
}
