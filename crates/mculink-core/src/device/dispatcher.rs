//! Device-side frame dispatcher.
//!
//! Models the firmware end of the link: bytes are parsed one at a time into a
//! fixed receive buffer, so memory use does not depend on the traffic.

use tracing::{debug, trace, warn};

use crate::checksum::Checksum;
use crate::protocol::{
    DATA, DEV_READY, Endianness, FrameCodec, HEADER_SIZE, MAX_PAYLOAD, RESET, SET_TRANS_SIZE,
    decode_trans_size,
};

use super::commands::{CommandResult, CommandTable};

/// Receive buffer large enough for a maximal frame with a 4-byte checksum.
pub const DEFAULT_RX_BUFFER: usize = HEADER_SIZE + MAX_PAYLOAD + 4;

/// Application side of the device.
pub trait DeviceHandler {
    /// Push bytes onto the wire.
    fn transmit(&mut self, bytes: &[u8]);

    fn on_transfer_start(&mut self, _major: u8, _expected: u32) {}

    fn on_data(&mut self, _major: u8, _chunk: &[u8]) {}

    fn on_transfer_complete(&mut self, _major: u8, _length: u32) {}

    fn on_reset(&mut self) {}
}

/// Dispatcher options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherOptions {
    /// Answer every `DATA` frame with `DEV_READY`, like the host does.
    pub symmetric_ack: bool,
    pub size_endianness: Endianness,
}

/// Running transfer counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTransfer {
    pub major: u8,
    pub expected: u32,
    pub received: u32,
}

/// Byte-at-a-time frame parser and dispatcher.
pub struct Dispatcher<H, const N: usize = DEFAULT_RX_BUFFER> {
    checksum: Checksum,
    seed: Vec<u8>,
    commands: CommandTable<H>,
    options: DispatcherOptions,
    buf: [u8; N],
    len: usize,
    /// Bytes of an oversized frame still to discard.
    skip: usize,
    transfer: Option<DeviceTransfer>,
    dropped: u32,
}

impl<H: DeviceHandler, const N: usize> Dispatcher<H, N> {
    pub fn new(codec: &FrameCodec, commands: CommandTable<H>, options: DispatcherOptions) -> Self {
        const { assert!(N >= HEADER_SIZE, "receive buffer cannot hold a frame header") };
        Self {
            checksum: codec.checksum().clone(),
            seed: codec.seed().to_vec(),
            commands,
            options,
            buf: [0u8; N],
            len: 0,
            skip: 0,
            transfer: None,
            dropped: 0,
        }
    }

    /// Active transfer counters, if any.
    pub fn transfer(&self) -> Option<DeviceTransfer> {
        self.transfer
    }

    /// Frames discarded for bad checksums, bad sizes or unknown commands.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Feed received bytes.
    pub fn push(&mut self, data: &[u8], handler: &mut H) {
        for &byte in data {
            self.push_byte(byte, handler);
        }
    }

    fn push_byte(&mut self, byte: u8, handler: &mut H) {
        if self.skip > 0 {
            self.skip -= 1;
            return;
        }

        self.buf[self.len] = byte;
        self.len += 1;
        if self.len < HEADER_SIZE {
            return;
        }

        let body = HEADER_SIZE + self.buf[2] as usize;
        let total = body + self.checksum.size();
        if total > N {
            debug!(total, capacity = N, "Frame larger than receive buffer, skipped");
            self.skip = total - self.len;
            self.len = 0;
            self.dropped += 1;
            return;
        }
        if self.len < total {
            return;
        }

        self.len = 0;
        let frame = self.buf;
        let valid = self
            .checksum
            .compute(&frame[..body], &self.seed)
            .is_ok_and(|sum| Checksum::verify(&sum, &frame[body..total]));
        if !valid {
            trace!("Bad checksum, frame dropped");
            self.dropped += 1;
            return;
        }
        self.dispatch(handler, frame[0], frame[1], &frame[HEADER_SIZE..body]);
    }

    fn dispatch(&mut self, handler: &mut H, major: u8, minor: u8, payload: &[u8]) {
        match (major, minor) {
            (RESET, _) => {
                self.transfer = None;
                handler.on_reset();
            }
            (DEV_READY, _) => {}
            (_, SET_TRANS_SIZE) => {
                let Some(expected) = decode_trans_size(payload, self.options.size_endianness) else {
                    self.dropped += 1;
                    return;
                };
                handler.on_transfer_start(major, expected);
                if expected == 0 {
                    self.transfer = None;
                    handler.on_transfer_complete(major, 0);
                } else {
                    self.transfer = Some(DeviceTransfer {
                        major,
                        expected,
                        received: 0,
                    });
                }
            }
            (_, DATA) => self.on_data(handler, major, payload),
            _ => match self.commands.dispatch(handler, major, minor, payload) {
                CommandResult::Executed => {}
                other => {
                    debug!(major, minor, ?other, "Command dropped");
                    self.dropped += 1;
                }
            },
        }
    }

    fn on_data(&mut self, handler: &mut H, major: u8, payload: &[u8]) {
        let Some(mut transfer) = self.transfer.filter(|t| t.major == major) else {
            self.dropped += 1;
            return;
        };
        if !payload.is_empty() {
            transfer.received = transfer.received.saturating_add(payload.len() as u32);
            handler.on_data(major, payload);
        }

        if self.options.symmetric_ack {
            self.send_ack(handler, major);
        }

        if transfer.received >= transfer.expected {
            self.transfer = None;
            handler.on_transfer_complete(major, transfer.received);
        } else {
            self.transfer = Some(transfer);
        }
    }

    /// Emit `DEV_READY` for `major`, built in a buffer of the receive size.
    fn send_ack(&self, handler: &mut H, major: u8) {
        let ack = [DEV_READY, major, 0];
        let sum = match self.checksum.compute(&ack, &self.seed) {
            Ok(sum) => sum,
            Err(e) => {
                warn!(major, error = %e, "Cannot checksum DEV_READY, not sent");
                return;
            }
        };
        let total = HEADER_SIZE + sum.len();
        if total > N {
            warn!(total, capacity = N, "DEV_READY does not fit the frame buffer, not sent");
            return;
        }
        let mut out = [0u8; N];
        out[..HEADER_SIZE].copy_from_slice(&ack);
        out[HEADER_SIZE..total].copy_from_slice(&sum);
        handler.transmit(&out[..total]);
    }
}
