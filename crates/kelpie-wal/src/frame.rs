//! Record framing: the 9-byte header in front of every payload.
//!
//! Frame layout (big-endian):
//! - index: u32 — the record's logical index
//! - type: u8 — the payload's registered type tag
//! - crc: u32 — CRC-32 (IEEE) over the payload bytes only
//!
//! The header does not carry a length; payloads are self-delimiting via
//! their codec.

use bytes::{Buf, BufMut};

use crate::error::{Result, WalError};

pub const FRAME_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub index: u32,
    pub type_tag: u8,
    pub crc: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(self.index);
        buf.put_u8(self.type_tag);
        buf.put_u32(self.crc);
        out
    }

    /// Parses a header from the front of `buf`. Anything shorter than the
    /// full header is a torn frame.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(WalError::UnexpectedEof);
        }
        let index = buf.get_u32();
        let type_tag = buf.get_u8();
        let crc = buf.get_u32();
        Ok(Self {
            index,
            type_tag,
            crc,
        })
    }
}

/// The checksum stored in the frame header: CRC-32 (IEEE) over the payload.
pub fn payload_crc(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            index: 42,
            type_tag: 7,
            crc: 0xdead_beef,
        };
        let encoded = header.encode();
        assert_eq!(FrameHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = FrameHeader {
            index: 1,
            type_tag: 2,
            crc: 3,
        };
        assert_eq!(header.encode(), [0, 0, 0, 1, 2, 0, 0, 0, 3]);
    }

    #[test]
    fn test_short_header_is_torn() {
        let header = FrameHeader {
            index: 1,
            type_tag: 2,
            crc: 3,
        };
        let encoded = header.encode();
        for len in 1..FRAME_HEADER_SIZE {
            assert!(matches!(
                FrameHeader::decode(&encoded[..len]),
                Err(WalError::UnexpectedEof)
            ));
        }
    }

    #[test]
    fn test_payload_crc_is_ieee() {
        // Known CRC-32 (IEEE) vector.
        assert_eq!(payload_crc(b"123456789"), 0xcbf4_3926);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_header_roundtrip(index in any::<u32>(), type_tag in any::<u8>(), crc in any::<u32>()) {
            let header = FrameHeader { index, type_tag, crc };
            let decoded = FrameHeader::decode(&header.encode()).unwrap();
            prop_assert_eq!(decoded, header);
        }

        #[test]
        fn prop_crc_detects_flips(payload in prop::collection::vec(any::<u8>(), 1..256), flip in 0usize..256) {
            prop_assume!(flip < payload.len());
            let crc = payload_crc(&payload);
            let mut corrupted = payload.clone();
            corrupted[flip] ^= 0xFF;
            prop_assert_ne!(payload_crc(&corrupted), crc);
        }
    }
}
