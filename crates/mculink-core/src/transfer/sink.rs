//! Frame output path shared by the controller and the session.

use std::sync::Arc;

use tracing::trace;

use crate::events::{Direction, LinkEvent, Observer};
use crate::protocol::FrameCodec;
use crate::transport::{Transport, TransportError};

use super::TransferError;

/// Encodes frames and writes them to the transport, reporting each one as a
/// `Packet` event.
pub struct FrameSink {
    transport: Arc<dyn Transport>,
    codec: Arc<FrameCodec>,
    observer: Arc<dyn Observer>,
}

impl FrameSink {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<FrameCodec>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            transport,
            codec,
            observer,
        }
    }

    pub fn codec(&self) -> &Arc<FrameCodec> {
        &self.codec
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Encode and write one frame.
    pub fn send(&self, major: u8, minor: u8, payload: &[u8]) -> Result<(), TransferError> {
        let bytes = self.codec.encode_to_vec(major, minor, payload)?;
        if !self.transport.is_connected() {
            return Err(TransferError::Transport(TransportError::NotConnected));
        }
        self.transport.write(&bytes)?;
        trace!(
            major = %format!("{:#04X}", major),
            minor = %format!("{:#04X}", minor),
            len = payload.len(),
            "Frame sent"
        );
        self.observer.on_event(&LinkEvent::Packet {
            direction: Direction::Send,
            major,
            minor,
            length: payload.len(),
        });
        Ok(())
    }
}
