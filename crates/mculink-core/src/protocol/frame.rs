//! Frame encoding and decoding.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────┬──────────┬────────────────┬─────────────────┐
//! │ Major    │ Minor    │ Length   │ Payload        │ Checksum        │
//! │ (1B)     │ (1B)     │ (1B)     │ (Length bytes) │ (algorithm size)│
//! └──────────┴──────────┴──────────┴────────────────┴─────────────────┘
//! ```
//! The checksum covers everything before it and starts from the codec's seed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

use super::constants::{DEV_READY, HEADER_SIZE, MAX_PAYLOAD, RESET};
use crate::checksum::{Checksum, ChecksumError};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Checksum mismatch on frame {major:#04X}/{minor:#04X}")]
    ChecksumMismatch { major: u8, minor: u8 },

    #[error("Checksum error: {0}")]
    Checksum(#[from] ChecksumError),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub major: u8,
    pub minor: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(major: u8, minor: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            major,
            minor,
            payload: payload.into(),
        }
    }

    pub fn is_dev_ready(&self) -> bool {
        self.major == DEV_READY
    }

    pub fn is_reset(&self) -> bool {
        self.major == RESET
    }
}

/// Builds and parses frames with a fixed checksum algorithm and seed.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    checksum: Checksum,
    seed: Vec<u8>,
}

impl FrameCodec {
    /// Create a codec. `seed` must match the checksum width.
    pub fn new(checksum: Checksum, seed: Vec<u8>) -> Result<Self, ChecksumError> {
        if seed.len() != checksum.size() {
            return Err(ChecksumError::SeedLength {
                expected: checksum.size(),
                actual: seed.len(),
            });
        }
        Ok(Self { checksum, seed })
    }

    /// Create a codec from a numeric seed projected onto the checksum width.
    pub fn with_seed(checksum: Checksum, seed: u32) -> Self {
        let seed = checksum.seed_bytes(seed);
        Self { checksum, seed }
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    /// Total bytes a frame with `payload_len` bytes occupies on the wire.
    pub fn wire_size(&self, payload_len: usize) -> usize {
        HEADER_SIZE + payload_len + self.checksum.size()
    }

    /// Encode one frame into `dst`.
    pub fn encode(
        &self,
        major: u8,
        minor: u8,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let start = dst.len();
        dst.reserve(self.wire_size(payload.len()));
        dst.put_u8(major);
        dst.put_u8(minor);
        dst.put_u8(payload.len() as u8);
        dst.put_slice(payload);

        let checksum = match self.checksum.compute(&dst[start..], &self.seed) {
            Ok(c) => c,
            Err(e) => {
                dst.truncate(start);
                return Err(e.into());
            }
        };
        dst.put_slice(&checksum);
        Ok(())
    }

    /// Encode one frame into a fresh buffer.
    pub fn encode_to_vec(&self, major: u8, minor: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut buf = BytesMut::new();
        self.encode(major, minor, payload, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode a frame from the front of `src`.
    ///
    /// Returns `Ok(None)` if `src` does not hold a complete frame yet. A frame
    /// that fails verification, or whose checksum cannot be computed, is
    /// consumed from `src` and reported as an error so the caller can drop it.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let major = src[0];
        let minor = src[1];
        let len = src[2] as usize;
        let body = HEADER_SIZE + len;
        let total = body + self.checksum.size();
        if src.len() < total {
            return Ok(None);
        }

        let expected = match self.checksum.compute(&src[..body], &self.seed) {
            Ok(c) => c,
            Err(e) => {
                src.advance(total);
                return Err(e.into());
            }
        };
        if !Checksum::verify(&expected, &src[body..total]) {
            src.advance(total);
            return Err(FrameError::ChecksumMismatch { major, minor });
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        src.advance(self.checksum.size());

        trace!(major, minor, len, "Decoded frame");
        Ok(Some(Frame {
            major,
            minor,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc8_codec() -> FrameCodec {
        FrameCodec::with_seed(Checksum::Crc8, 0)
    }

    #[test]
    fn test_encode_layout() {
        let codec = crc8_codec();
        let bytes = codec.encode_to_vec(0x10, 0x02, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&bytes[..5], &[0x10, 0x02, 0x02, 0xAA, 0xBB]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes[5], crate::checksum::crc8(&bytes[..5], 0));
    }

    #[test]
    fn test_crc16_checksum_is_big_endian_trailer() {
        let codec = FrameCodec::with_seed(Checksum::Crc16, 0xFFFF);
        let bytes = codec.encode_to_vec(0x01, 0x01, b"hi").unwrap();
        let crc = crate::checksum::crc16(&bytes[..5], 0xFFFF);
        assert_eq!(&bytes[5..], &crc.to_be_bytes());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = crc8_codec();
        let err = codec.encode_to_vec(1, 1, &[0u8; 256]).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 256, max: 255 }));
    }

    #[test]
    fn test_roundtrip_every_length() {
        for checksum in [Checksum::Crc8, Checksum::Crc16] {
            let codec = FrameCodec::with_seed(checksum, 0x5A5A);
            for len in 0..=MAX_PAYLOAD {
                let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
                let mut buf = BytesMut::new();
                codec.encode(0x20, 0x03, &payload, &mut buf).unwrap();
                let frame = codec.decode(&mut buf).unwrap().unwrap();
                assert_eq!(frame.major, 0x20);
                assert_eq!(frame.minor, 0x03);
                assert_eq!(frame.payload.as_ref(), payload.as_slice());
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let codec = crc8_codec();
        let bytes = codec.encode_to_vec(1, 2, b"abcdef").unwrap();
        for cut in 0..bytes.len() {
            let mut buf = BytesMut::from(&bytes[..cut]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_decode_mismatch_consumes_frame() {
        let codec = crc8_codec();
        let mut bytes = codec.encode_to_vec(1, 2, b"abc").unwrap();
        bytes[3] ^= 0x01;
        let mut buf = BytesMut::from(&bytes[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { major: 1, minor: 2 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_seed_changes_checksum() {
        let a = FrameCodec::with_seed(Checksum::Crc8, 0x00);
        let b = FrameCodec::with_seed(Checksum::Crc8, 0x01);
        let mut buf = BytesMut::from(&a.encode_to_vec(1, 1, b"x").unwrap()[..]);
        assert!(b.decode(&mut buf).is_err());
    }

    #[test]
    fn test_new_checks_seed_width() {
        assert!(FrameCodec::new(Checksum::Crc16, vec![0]).is_err());
        assert!(FrameCodec::new(Checksum::Crc16, vec![0, 0]).is_ok());
    }

    #[test]
    fn test_control_frames() {
        assert!(Frame::new(DEV_READY, 0x10, Bytes::new()).is_dev_ready());
        assert!(Frame::new(RESET, 0, Bytes::new()).is_reset());
        assert!(!Frame::new(0x10, 0, Bytes::new()).is_reset());
    }
}
