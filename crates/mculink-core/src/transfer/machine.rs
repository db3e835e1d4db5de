//! Transfer bookkeeping for both directions.

use std::fmt;
use std::ops::Range;

/// Receive-side session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceivePhase {
    /// No transfer announced.
    #[default]
    Idle,
    /// `SET_TRANS_SIZE` seen, no data yet.
    SizeAnnounced,
    /// At least one chunk accepted.
    Transferring,
    /// The announced length was reached.
    Complete,
}

impl fmt::Display for ReceivePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceivePhase::Idle => write!(f, "IDLE"),
            ReceivePhase::SizeAnnounced => write!(f, "SIZE_ANNOUNCED"),
            ReceivePhase::Transferring => write!(f, "TRANSFERRING"),
            ReceivePhase::Complete => write!(f, "COMPLETE"),
        }
    }
}

impl ReceivePhase {
    /// Whether `DATA` frames are accepted in this phase.
    pub fn is_active(&self) -> bool {
        matches!(self, ReceivePhase::SizeAnnounced | ReceivePhase::Transferring)
    }
}

/// What a `DATA` frame did to the receive counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Empty payload: acknowledged, counters untouched.
    Keepalive,
    /// Bytes accepted, transfer still running.
    Accepted { percent: u8 },
    /// Bytes accepted and the announced length reached.
    Completed { length: u32 },
    /// No session is running for this key.
    Inactive,
    /// The chunk would exceed the announced length.
    Overflow { current: u32, expected: u32, len: usize },
}

/// Length counters of one receive session.
#[derive(Debug, Default)]
pub struct ReceiveCounters {
    pub phase: ReceivePhase,
    pub expected_length: u32,
    pub current_length: u32,
}

impl ReceiveCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transfer of `expected` bytes. Returns true when the transfer is
    /// already complete (zero length).
    pub fn announce(&mut self, expected: u32) -> bool {
        self.current_length = 0;
        self.expected_length = expected;
        if expected == 0 {
            self.phase = ReceivePhase::Complete;
            true
        } else {
            self.phase = ReceivePhase::SizeAnnounced;
            false
        }
    }

    /// Account for a chunk of `len` bytes.
    pub fn accept(&mut self, len: usize) -> ChunkOutcome {
        if !self.phase.is_active() {
            return ChunkOutcome::Inactive;
        }
        if len == 0 {
            return ChunkOutcome::Keepalive;
        }
        let remaining = (self.expected_length - self.current_length) as usize;
        if len > remaining {
            return ChunkOutcome::Overflow {
                current: self.current_length,
                expected: self.expected_length,
                len,
            };
        }

        self.current_length += len as u32;
        if self.current_length == self.expected_length {
            let length = self.expected_length;
            self.current_length = 0;
            self.expected_length = 0;
            self.phase = ReceivePhase::Complete;
            ChunkOutcome::Completed { length }
        } else {
            self.phase = ReceivePhase::Transferring;
            ChunkOutcome::Accepted {
                percent: percent(self.current_length as u64, self.expected_length as u64),
            }
        }
    }

    /// Abort: counters cleared, back to idle.
    pub fn abort(&mut self) {
        self.phase = ReceivePhase::Idle;
        self.current_length = 0;
        self.expected_length = 0;
    }
}

/// `floor(done * 100 / total)`, clamped to 100.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

/// Number of `DATA` frames needed for `len` bytes in chunks of `chunk_size`.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size)
}

/// Sender-side chunk tracking.
#[derive(Debug)]
pub struct ChunkPlan {
    /// Total bytes to send.
    pub total_len: usize,
    /// Maximum payload per chunk.
    pub chunk_size: usize,
    /// Total chunks to send.
    pub total_chunks: usize,
    /// Current chunk index.
    pub current_chunk: usize,
    /// Byte offset into the data.
    pub byte_offset: usize,
}

impl ChunkPlan {
    pub fn new(total_len: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            total_len,
            chunk_size,
            total_chunks: chunk_count(total_len, chunk_size),
            current_chunk: 0,
            byte_offset: 0,
        }
    }

    /// Byte range of the current chunk, or `None` when done.
    pub fn current(&self) -> Option<Range<usize>> {
        if self.is_done() {
            return None;
        }
        let end = (self.byte_offset + self.chunk_size).min(self.total_len);
        Some(self.byte_offset..end)
    }

    /// Move past the current chunk.
    pub fn advance(&mut self) {
        if let Some(range) = self.current() {
            self.current_chunk += 1;
            self.byte_offset = range.end;
        }
    }

    pub fn is_done(&self) -> bool {
        self.current_chunk >= self.total_chunks
    }

    pub fn is_last_chunk(&self) -> bool {
        self.current_chunk + 1 == self.total_chunks
    }

    /// Progress after the chunks sent so far.
    pub fn percent(&self) -> u8 {
        percent(self.byte_offset as u64, self.total_len as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 128), 0);
        assert_eq!(chunk_count(1, 128), 1);
        assert_eq!(chunk_count(128, 128), 1);
        assert_eq!(chunk_count(129, 128), 2);
        assert_eq!(chunk_count(1000, 255), 4);
    }

    #[test]
    fn test_plan_walks_all_bytes() {
        let mut plan = ChunkPlan::new(300, 128);
        assert_eq!(plan.total_chunks, 3);

        let mut ranges = Vec::new();
        while let Some(range) = plan.current() {
            ranges.push(range);
            plan.advance();
        }
        assert_eq!(ranges, vec![0..128, 128..256, 256..300]);
        assert!(plan.is_done());
        assert_eq!(plan.percent(), 100);
    }

    #[test]
    fn test_plan_last_chunk() {
        let mut plan = ChunkPlan::new(200, 100);
        assert!(!plan.is_last_chunk());
        plan.advance();
        assert!(plan.is_last_chunk());
    }

    #[test]
    fn test_percent_floors() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn test_counters_complete_and_reset() {
        let mut c = ReceiveCounters::new();
        assert!(!c.announce(10));
        assert_eq!(c.phase, ReceivePhase::SizeAnnounced);

        assert_eq!(c.accept(4), ChunkOutcome::Accepted { percent: 40 });
        assert_eq!(c.phase, ReceivePhase::Transferring);
        assert_eq!(c.accept(0), ChunkOutcome::Keepalive);
        assert_eq!(c.current_length, 4);

        assert_eq!(c.accept(6), ChunkOutcome::Completed { length: 10 });
        assert_eq!((c.current_length, c.expected_length), (0, 0));
        assert_eq!(c.phase, ReceivePhase::Complete);

        // A late keepalive on the finished session does nothing.
        assert_eq!(c.accept(0), ChunkOutcome::Inactive);
    }

    #[test]
    fn test_counters_reject_overflow() {
        let mut c = ReceiveCounters::new();
        c.announce(5);
        c.accept(3);
        assert_eq!(
            c.accept(3),
            ChunkOutcome::Overflow {
                current: 3,
                expected: 5,
                len: 3
            }
        );
        assert_eq!(c.current_length, 3);
    }

    #[test]
    fn test_counters_zero_length() {
        let mut c = ReceiveCounters::new();
        assert!(c.announce(0));
        assert_eq!(c.accept(1), ChunkOutcome::Inactive);
    }

    #[test]
    fn test_idle_ignores_data() {
        let mut c = ReceiveCounters::new();
        assert_eq!(c.accept(5), ChunkOutcome::Inactive);
        c.announce(5);
        c.abort();
        assert_eq!(c.accept(5), ChunkOutcome::Inactive);
    }
}
