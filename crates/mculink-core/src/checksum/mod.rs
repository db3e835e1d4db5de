//! Checksum layer.
//!
//! Every frame is sealed with one of the algorithms below. All of them take an
//! explicit seed so a sequence of computations can be chained: the result of
//! one call is a valid seed for the next.

mod crc;
mod external;

use std::fmt;

use thiserror::Error;

pub use self::crc::{CRC8_POLY, CRC16_POLY, crc8, crc16};
pub use external::{ExternalChecksum, decode_hex, encode_hex};

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("Seed must be {expected} bytes, got {actual}")]
    SeedLength { expected: usize, actual: usize },

    #[error("Failed to run checksum helper {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checksum helper {path} failed: {status}")]
    HelperFailed { path: String, status: String },

    #[error("Malformed checksum helper output: {0:?}")]
    Malformed(String),

    #[error("Checksum helper returned {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
}

/// Checksum algorithm used by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    /// Reflected CRC-8, 1 byte.
    Crc8,
    /// Reflected CRC-16, 2 bytes big-endian.
    Crc16,
    /// Out-of-process helper with a self-reported width.
    External(ExternalChecksum),
}

impl Checksum {
    /// Width of the checksum in bytes.
    pub fn size(&self) -> usize {
        match self {
            Checksum::Crc8 => 1,
            Checksum::Crc16 => 2,
            Checksum::External(ext) => ext.size(),
        }
    }

    /// Compute the checksum of `data` starting from `seed`.
    ///
    /// `seed` must be exactly [`size`](Self::size) bytes.
    pub fn compute(&self, data: &[u8], seed: &[u8]) -> Result<Vec<u8>, ChecksumError> {
        if seed.len() != self.size() {
            return Err(ChecksumError::SeedLength {
                expected: self.size(),
                actual: seed.len(),
            });
        }
        match self {
            Checksum::Crc8 => Ok(vec![crc8(data, seed[0])]),
            Checksum::Crc16 => {
                let seed = u16::from_be_bytes([seed[0], seed[1]]);
                Ok(crc16(data, seed).to_be_bytes().to_vec())
            }
            Checksum::External(ext) => ext.compute(data, seed),
        }
    }

    /// Byte-exact comparison.
    pub fn verify(a: &[u8], b: &[u8]) -> bool {
        a == b
    }

    /// Project a numeric seed onto this algorithm's width.
    ///
    /// Takes the low-order bytes of `seed` in big-endian order; widths above 4
    /// bytes are zero-padded on the left.
    pub fn seed_bytes(&self, seed: u32) -> Vec<u8> {
        let size = self.size();
        let be = seed.to_be_bytes();
        if size <= be.len() {
            be[be.len() - size..].to_vec()
        } else {
            let mut out = vec![0u8; size - be.len()];
            out.extend_from_slice(&be);
            out
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::Crc8 => write!(f, "CRC-8"),
            Checksum::Crc16 => write!(f, "CRC-16"),
            Checksum::External(ext) => write!(f, "external({})", ext.path().display()),
        }
    }
}

/// Running checksum over a sequence of chunks.
///
/// Each chunk is computed with the previous result as its seed, so the final
/// value equals a single computation over the concatenated chunks.
#[derive(Debug, Clone)]
pub struct ChainedChecksum {
    checksum: Checksum,
    value: Vec<u8>,
}

impl ChainedChecksum {
    pub fn new(checksum: Checksum, seed: Vec<u8>) -> Self {
        Self {
            checksum,
            value: seed,
        }
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), ChecksumError> {
        self.value = self.checksum.compute(data, &self.value)?;
        Ok(())
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}
