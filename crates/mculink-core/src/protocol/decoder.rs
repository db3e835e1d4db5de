//! Stream reassembly: turns arbitrary byte slices from a transport into frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::debug;

use super::frame::{Frame, FrameCodec, FrameError};

/// Buffers incoming bytes until whole frames can be decoded.
///
/// Corrupted frames are dropped without a reply; the sender recovers through
/// its own timeout and retry.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: Arc<FrameCodec>,
    buf: BytesMut,
    frame_timeout: Duration,
    last_rx: Option<Instant>,
    dropped: u64,
}

impl FrameDecoder {
    pub fn new(codec: Arc<FrameCodec>, frame_timeout: Duration) -> Self {
        Self {
            codec,
            buf: BytesMut::with_capacity(512),
            frame_timeout,
            last_rx: None,
            dropped: 0,
        }
    }

    /// Feed bytes and collect every complete, valid frame.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.push_at(data, Instant::now())
    }

    fn push_at(&mut self, data: &[u8], now: Instant) -> Vec<Frame> {
        if let Some(last) = self.last_rx
            && !self.buf.is_empty()
            && now.saturating_duration_since(last) > self.frame_timeout
        {
            debug!(stale = self.buf.len(), "Discarding stale partial frame");
            self.buf.clear();
        }
        self.last_rx = Some(now);
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(FrameError::ChecksumMismatch { major, minor }) => {
                    self.dropped += 1;
                    debug!(major, minor, "Dropped frame with bad checksum");
                }
                Err(e) => {
                    self.dropped += 1;
                    debug!(error = %e, "Dropped undecodable frame");
                }
            }
        }
        frames
    }

    /// Forget any buffered partial frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.last_rx = None;
    }

    /// Bytes waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Frames dropped so far because of checksum failures.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
