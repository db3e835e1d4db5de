//! Bit-serial reflected CRCs.
//!
//! Both variants keep no final XOR and no output reflection, so the value
//! returned is the raw register. That makes `crc(empty, seed) == seed` and lets
//! one chunk's result seed the next.

/// Reflected form of the CRC-8 polynomial 0x07.
pub const CRC8_POLY: u8 = 0xE0;

/// Reflected form of the CRC-16 polynomial 0x1021.
pub const CRC16_POLY: u16 = 0x8408;

/// CRC-8 over `data`, starting from `seed`.
pub fn crc8(data: &[u8], seed: u8) -> u8 {
    let mut crc = seed;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ CRC8_POLY
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// CRC-16 over `data`, starting from `seed`.
pub fn crc16(data: &[u8], seed: u16) -> u16 {
    let mut crc = seed;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ CRC16_POLY
            } else {
                crc >> 1
            };
        }
    }
    crc
}
