//! Binary frame format for byte-stream transports.
//!
//! WebSocket transports carry one envelope per message and need no framing.
//! Plain TCP and TLS streams wrap every envelope in a frame:
//!
//! ```text
//! +--------+---------+--------+-------------+--------+
//! | magic  | version | flags  | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes|
//! +--------+---------+--------+-------------+--------+
//! | payload (payload_len bytes)                      |
//! +--------------------------------------------------+
//! ```
//!
//! All integers are big-endian.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes opening every frame: "TTHR"
pub const MAGIC: [u8; 4] = *b"TTHR";

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// The CRC32C field covers the payload.
    pub const CRC_PRESENT: u16 = 1 << 0;

    const VALID_V1_MASK: u16 = 0x0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// One framed envelope.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// Encoded envelope, opaque to the framing layer.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a checksummed frame around `payload`.
    pub fn new(payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    /// Encodes the frame into bytes ready for the wire.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(payload_len);
        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when more bytes are
    /// needed. A complete frame is consumed from `buf` even if its checksum
    /// turns out to be wrong.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        let total_len = FRAME_HEADER_SIZE + payload_len as usize;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_payload(payload: &'static str) -> BytesMut {
        Frame::new(Bytes::from(payload)).encode().unwrap()
    }

    #[test]
    fn test_frame_layout() {
        let encoded = encode_payload(r#"{"id":"a1","method":"ping"}"#);

        assert_eq!(&encoded[0..4], b"TTHR");
        assert_eq!(u16::from_be_bytes([encoded[4], encoded[5]]), 1);
        assert_eq!(u16::from_be_bytes([encoded[6], encoded[7]]), FrameFlags::CRC_PRESENT);
        assert_eq!(
            u32::from_be_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]) as usize,
            encoded.len() - FRAME_HEADER_SIZE
        );
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = encode_payload(r#"{"result":null}"#);
        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
        // The corrupt frame is consumed so the stream can be inspected further.
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_header_not_complete() {
        let mut buf = BytesMut::from(&b"TTHR\x00\x01\x00\x01"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_payload_not_complete() {
        let encoded = encode_payload(r#"{"id":"x"}"#);
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[encoded.len() - 3..]);
        let frame = Frame::decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), br#"{"id":"x"}"#);
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = BytesMut::from(&b"TTHR\x00\x63\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_invalid_flags() {
        let result = FrameFlags::from_bits(0x0100);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0100))));
    }

    #[test]
    fn test_frame_too_large() {
        let huge_payload = vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize];
        let frame = Frame::new(Bytes::from(huge_payload));
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_declared_length_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u16(crate::PROTOCOL_VERSION);
        buf.put_u16(0);
        buf.put_u32(MAX_PAYLOAD_SIZE + 1);
        buf.put_u32(0);

        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_without_crc() {
        let mut frame = Frame::new(Bytes::from(r#"{"ok":true}"#));
        frame.flags = FrameFlags::new();

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_payload(r#"{"id":"1"}"#));
        buf.extend_from_slice(&encode_payload(r#"{"id":"2"}"#));

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), br#"{"id":"1"}"#);
        assert_eq!(second.payload.as_ref(), br#"{"id":"2"}"#);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_decode_returns_encoded_payload(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut buf = Frame::new(Bytes::from(payload.clone())).encode().unwrap();
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut buf = BytesMut::from(bytes.as_slice());
            let _ = Frame::decode(&mut buf);
        }
    }
}
