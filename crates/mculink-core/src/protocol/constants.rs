//! Protocol constants shared by both ends of the link.

// ============================================================================
// Frame Layout
// ============================================================================

/// Header: major key (1) + minor key (1) + length (1).
pub const HEADER_SIZE: usize = 3;

/// Hard ceiling of the one-byte length field.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// `SET_TRANS_SIZE` payload length (u32).
pub const TRANS_SIZE_LEN: usize = 4;

// ============================================================================
// Reserved Major Keys
// ============================================================================

/// Backpressure acknowledgment. Empty payload; the minor key carries the
/// major key of the session being acknowledged.
pub const DEV_READY: u8 = 0xFE;

/// Abort every active session. Minor key and payload are ignored.
pub const RESET: u8 = 0xFF;

// ============================================================================
// Transfer Minor Keys (under the session owner's major key)
// ============================================================================

/// Announce the total length of the upcoming transfer.
pub const SET_TRANS_SIZE: u8 = 0xFE;

/// One chunk of a transfer. Empty payload is a keepalive.
pub const DATA: u8 = 0xFF;

// ============================================================================
// Transfer Defaults
// ============================================================================

/// Default chunk size for `DATA` frames.
pub const DEFAULT_MAX_CHUNK: usize = 128;

/// Time to wait for `DEV_READY` before resending a chunk.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 500;

/// Resends per chunk before the transfer fails.
pub const DEFAULT_PACKET_RETRIES: u8 = 2;

/// A partial frame idle for longer than this is discarded.
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 200;

/// Whether `major` is reserved for link control.
pub fn is_reserved_major(major: u8) -> bool {
    major == DEV_READY || major == RESET
}

/// Whether `minor` belongs to the chunked transfer protocol.
pub fn is_transfer_minor(minor: u8) -> bool {
    minor == SET_TRANS_SIZE || minor == DATA
}
