//! `SET_TRANS_SIZE` payload encoding.
//!
//! The 4-byte length uses one byte order for the whole deployment; both ends
//! must be configured the same way.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::constants::TRANS_SIZE_LEN;

/// Byte order of the transfer size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Encode a transfer length.
pub fn encode_trans_size(len: u32, endianness: Endianness) -> [u8; TRANS_SIZE_LEN] {
    let mut buf = Vec::with_capacity(TRANS_SIZE_LEN);
    // Writing into a Vec cannot fail.
    let _ = match endianness {
        Endianness::Little => buf.write_u32::<LittleEndian>(len),
        Endianness::Big => buf.write_u32::<BigEndian>(len),
    };
    let mut out = [0u8; TRANS_SIZE_LEN];
    out.copy_from_slice(&buf);
    out
}

/// Decode a transfer length. The payload must be exactly 4 bytes.
pub fn decode_trans_size(payload: &[u8], endianness: Endianness) -> Option<u32> {
    if payload.len() != TRANS_SIZE_LEN {
        return None;
    }
    let mut cursor = Cursor::new(payload);
    match endianness {
        Endianness::Little => cursor.read_u32::<LittleEndian>().ok(),
        Endianness::Big => cursor.read_u32::<BigEndian>().ok(),
    }
}
