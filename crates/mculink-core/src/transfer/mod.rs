//! Chunked transfers with per-chunk acknowledgment.

pub mod controller;
pub mod machine;
pub mod sink;
pub mod staging;

pub use controller::{ReceiveStatus, TransferController, TransferError};
pub use machine::{ChunkOutcome, ChunkPlan, ReceiveCounters, ReceivePhase, chunk_count, percent};
pub use sink::FrameSink;
pub use staging::{StagingBuffer, StagingLocation};
