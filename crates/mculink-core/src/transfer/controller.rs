//! Chunked transfer controller.
//!
//! One controller serves every major key on a link. Each key can run one
//! send and one receive session at a time; traffic for other keys
//! interleaves freely.
//!
//! Sending: `SET_TRANS_SIZE`, then one `DATA` frame per chunk. After each
//! chunk the sender suspends until the peer answers with `DEV_READY` (minor
//! key = our major key). A missing answer resends the same chunk; once the
//! retries are used up the transfer fails.
//!
//! Receiving: the mirror image. Every accepted chunk is staged on disk and
//! acknowledged. Chunks for keys without an announced size, and chunks that
//! would overflow the announced size, are dropped without an answer.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::checksum::ChainedChecksum;
use crate::config::TransferConfig;
use crate::events::{Direction, LinkEvent, LogLevel, Observer};
use crate::protocol::{
    DATA, DEV_READY, Frame, FrameError, MAX_PAYLOAD, RESET, SET_TRANS_SIZE, decode_trans_size,
    encode_trans_size, is_reserved_major,
};
use crate::transport::TransportError;

use super::machine::{ChunkOutcome, ChunkPlan, ReceiveCounters, ReceivePhase};
use super::sink::FrameSink;
use super::staging::{StagingBuffer, StagingLocation};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("A transfer for major key {major:#04X} is already running")]
    Busy { major: u8 },

    #[error("No DEV_READY for chunk {chunk} of major key {major:#04X} after {attempts} attempts")]
    Timeout { major: u8, chunk: usize, attempts: u32 },

    #[error("Transfer for major key {major:#04X} aborted")]
    Aborted { major: u8 },

    #[error("Key {major:#04X}/{minor:#04X} is reserved for link control")]
    ReservedKey { major: u8, minor: u8 },

    #[error("Transfer of {len} bytes exceeds the 32-bit length field")]
    TooLarge { len: usize },

    #[error("Nothing received for major key {major:#04X}")]
    NoData { major: u8 },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Staging error: {0}")]
    Staging(#[from] std::io::Error),
}

/// Wake-up delivered to a waiting sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckSignal {
    Ready,
    Reset,
}

/// Snapshot of a receive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStatus {
    pub phase: ReceivePhase,
    pub expected_length: u32,
    pub current_length: u32,
    /// Bytes held in the staging buffer.
    pub staged: u64,
}

struct ReceiveSession {
    counters: ReceiveCounters,
    staging: StagingBuffer,
    digest: Option<ChainedChecksum>,
}

impl ReceiveSession {
    /// Count, stage and fold one `DATA` payload.
    fn accept(&mut self, payload: &[u8]) -> std::io::Result<ChunkOutcome> {
        let outcome = self.counters.accept(payload.len());
        if matches!(
            outcome,
            ChunkOutcome::Accepted { .. } | ChunkOutcome::Completed { .. }
        ) {
            if let Err(e) = self.staging.append(payload) {
                self.counters.abort();
                return Err(e);
            }
            fold_digest(&mut self.digest, payload);
        }
        Ok(outcome)
    }
}

/// Removes a sender's ack channel when the send finishes or is dropped.
struct WaiterGuard<'a> {
    waiters: &'a Mutex<HashMap<u8, mpsc::UnboundedSender<AckSignal>>>,
    major: u8,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.major);
    }
}

/// Drives chunked transfers in both directions over one link.
pub struct TransferController {
    sink: FrameSink,
    config: TransferConfig,
    observer: Arc<dyn Observer>,
    staging: StagingLocation,
    receivers: Mutex<HashMap<u8, ReceiveSession>>,
    waiters: Mutex<HashMap<u8, mpsc::UnboundedSender<AckSignal>>>,
}

impl TransferController {
    pub fn new(sink: FrameSink, config: TransferConfig, observer: Arc<dyn Observer>) -> Self {
        let staging = StagingLocation::new(config.staging_dir.clone());
        Self {
            sink,
            config,
            observer,
            staging,
            receivers: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn emit(&self, event: LinkEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(LinkEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn progress(&self, direction: Direction, major: u8, percent: u8, label: impl Into<String>) {
        self.emit(LinkEvent::Progress {
            direction,
            major,
            percent,
            label: label.into(),
        });
    }

    fn new_digest(&self) -> Option<ChainedChecksum> {
        let codec = self.sink.codec();
        Some(ChainedChecksum::new(
            codec.checksum().clone(),
            codec.seed().to_vec(),
        ))
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send `data` as a chunked transfer under `major`.
    ///
    /// Resolves once the last chunk is acknowledged.
    #[instrument(skip(self, data), fields(major = %format!("{:#04X}", major), len = data.len()))]
    pub async fn send_transfer(&self, major: u8, data: &[u8]) -> Result<(), TransferError> {
        if is_reserved_major(major) {
            return Err(TransferError::ReservedKey { major, minor: DATA });
        }
        let len = u32::try_from(data.len()).map_err(|_| TransferError::TooLarge { len: data.len() })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut waiters = self.waiters.lock();
            if waiters.contains_key(&major) {
                return Err(TransferError::Busy { major });
            }
            waiters.insert(major, tx);
        }
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            major,
        };

        match self.run_send(major, data, len, &mut rx).await {
            Ok(digest) => {
                info!(len, "Transfer sent");
                self.emit(LinkEvent::TransferComplete {
                    direction: Direction::Send,
                    major,
                    length: len,
                    digest,
                });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Transfer failed");
                self.emit(LinkEvent::TransferFailed {
                    direction: Direction::Send,
                    major,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_send(
        &self,
        major: u8,
        data: &[u8],
        len: u32,
        rx: &mut mpsc::UnboundedReceiver<AckSignal>,
    ) -> Result<Option<Vec<u8>>, TransferError> {
        self.sink.send(
            major,
            SET_TRANS_SIZE,
            &encode_trans_size(len, self.config.size_endianness),
        )?;
        self.progress(Direction::Send, major, 0, "Sending");

        let mut digest = self.new_digest();
        let mut plan = ChunkPlan::new(data.len(), self.config.max_chunk_size.clamp(1, MAX_PAYLOAD));
        debug!(chunks = plan.total_chunks, chunk_size = plan.chunk_size, "Transfer planned");

        while let Some(range) = plan.current() {
            let chunk = &data[range];
            self.send_chunk(major, plan.current_chunk, chunk, rx).await?;
            fold_digest(&mut digest, chunk);
            plan.advance();
            if !plan.is_done() {
                self.progress(
                    Direction::Send,
                    major,
                    plan.percent(),
                    format!("Chunk {}/{}", plan.current_chunk, plan.total_chunks),
                );
            }
        }

        self.progress(Direction::Send, major, 100, "done");
        Ok(digest.map(|d| d.value().to_vec()))
    }

    async fn send_chunk(
        &self,
        major: u8,
        index: usize,
        chunk: &[u8],
        rx: &mut mpsc::UnboundedReceiver<AckSignal>,
    ) -> Result<(), TransferError> {
        let attempts = u32::from(self.config.packet_retries) + 1;
        for attempt in 1..=attempts {
            // Acks left over from an earlier attempt must not satisfy this one.
            loop {
                match rx.try_recv() {
                    Ok(AckSignal::Ready) => continue,
                    Ok(AckSignal::Reset) => return Err(TransferError::Aborted { major }),
                    Err(_) => break,
                }
            }

            self.sink.send(major, DATA, chunk)?;
            match timeout(self.config.ack_timeout(), rx.recv()).await {
                Ok(Some(AckSignal::Ready)) => return Ok(()),
                Ok(Some(AckSignal::Reset)) | Ok(None) => {
                    return Err(TransferError::Aborted { major });
                }
                Err(_) => {
                    debug!(chunk = index, attempt, attempts, "No DEV_READY in time");
                }
            }
        }
        Err(TransferError::Timeout {
            major,
            chunk: index,
            attempts,
        })
    }

    /// Send an empty `DATA` frame.
    pub fn send_keepalive(&self, major: u8) -> Result<(), TransferError> {
        if is_reserved_major(major) {
            return Err(TransferError::ReservedKey { major, minor: DATA });
        }
        self.sink.send(major, DATA, &[])
    }

    /// Tell the peer to abort everything, then abort locally.
    pub fn reset(&self) -> Result<(), TransferError> {
        let sent = self.sink.send(RESET, 0, &[]);
        self.abort_all("Reset requested");
        sent
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Route one incoming frame.
    ///
    /// Frames outside the transfer protocol are reported as `Received`.
    pub fn handle_frame(&self, frame: &Frame) {
        match frame.major {
            DEV_READY => self.on_dev_ready(frame.minor),
            RESET => self.abort_all("RESET received"),
            major => match frame.minor {
                SET_TRANS_SIZE => self.on_set_size(major, &frame.payload),
                DATA => self.on_data(major, &frame.payload),
                minor => self.emit(LinkEvent::Received {
                    major,
                    minor,
                    payload: frame.payload.clone(),
                }),
            },
        }
    }

    fn on_dev_ready(&self, major: u8) {
        match self.waiters.lock().get(&major) {
            Some(tx) => {
                let _ = tx.send(AckSignal::Ready);
            }
            None => debug!(major = %format!("{:#04X}", major), "Unsolicited DEV_READY"),
        }
    }

    fn on_set_size(&self, major: u8, payload: &[u8]) {
        let Some(expected) = decode_trans_size(payload, self.config.size_endianness) else {
            debug!(major, len = payload.len(), "SET_TRANS_SIZE with bad payload length dropped");
            return;
        };

        let mut problem = None;
        let completed = {
            let mut receivers = self.receivers.lock();
            let session = match receivers.entry(major) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => match self.staging.create() {
                    Ok(staging) => e.insert(ReceiveSession {
                        counters: ReceiveCounters::new(),
                        staging,
                        digest: None,
                    }),
                    Err(err) => {
                        drop(receivers);
                        self.log(
                            LogLevel::Warn,
                            format!("Cannot create staging buffer for {:#04X}: {}", major, err),
                        );
                        return;
                    }
                },
            };
            if self.config.clear_on_set
                && let Err(err) = session.staging.clear()
            {
                problem = Some(format!("Cannot clear staging buffer for {:#04X}: {}", major, err));
            }
            session.digest = self.new_digest();
            let completed = session.counters.announce(expected);
            completed.then(|| session.digest.as_ref().map(|d| d.value().to_vec()))
        };
        if let Some(message) = problem {
            self.log(LogLevel::Warn, message);
        }

        info!(major = %format!("{:#04X}", major), expected, "Receive started");
        self.progress(Direction::Receive, major, 0, "Receiving");
        if let Some(digest) = completed {
            self.finish_receive(major, 0, digest);
        }
    }

    fn on_data(&self, major: u8, payload: &[u8]) {
        enum Action {
            Ignore,
            Ack,
            Progress(u8),
            Complete(u32, Option<Vec<u8>>),
            Fail(String),
        }

        let action = {
            let mut receivers = self.receivers.lock();
            match receivers.get_mut(&major) {
                None => Action::Ignore,
                Some(session) => match session.accept(payload) {
                    Err(err) => {
                        warn!(major, error = %err, "Staging write failed");
                        Action::Fail("staging write failed".into())
                    }
                    Ok(ChunkOutcome::Inactive) => Action::Ignore,
                    Ok(ChunkOutcome::Overflow {
                        current,
                        expected,
                        len,
                    }) => {
                        warn!(major, current, expected, len, "Chunk overflows announced size, dropped");
                        Action::Ignore
                    }
                    Ok(ChunkOutcome::Keepalive) => Action::Ack,
                    Ok(ChunkOutcome::Accepted { percent }) => Action::Progress(percent),
                    Ok(ChunkOutcome::Completed { length }) => {
                        Action::Complete(length, session.digest.as_ref().map(|d| d.value().to_vec()))
                    }
                },
            }
        };

        match action {
            Action::Ignore => {
                debug!(major = %format!("{:#04X}", major), len = payload.len(), "DATA without active session ignored");
            }
            Action::Fail(reason) => {
                warn!(major, reason = %reason, "Receive aborted");
                self.emit(LinkEvent::TransferFailed {
                    direction: Direction::Receive,
                    major,
                    reason,
                });
            }
            Action::Ack => self.ack(major),
            Action::Progress(percent) => {
                self.ack(major);
                self.progress(Direction::Receive, major, percent, "Receiving");
            }
            Action::Complete(length, digest) => {
                self.ack(major);
                self.finish_receive(major, length, digest);
            }
        }
    }

    fn ack(&self, major: u8) {
        if let Err(e) = self.sink.send(DEV_READY, major, &[]) {
            self.log(
                LogLevel::Warn,
                format!("Failed to send DEV_READY for {:#04X}: {}", major, e),
            );
        }
    }

    fn finish_receive(&self, major: u8, length: u32, digest: Option<Vec<u8>>) {
        info!(major = %format!("{:#04X}", major), length, "Receive complete");
        self.progress(Direction::Receive, major, 100, "done");
        self.emit(LinkEvent::TransferComplete {
            direction: Direction::Receive,
            major,
            length,
            digest,
        });
    }

    /// Abort every session in both directions.
    fn abort_all(&self, reason: &str) {
        let aborted: Vec<u8> = {
            let mut receivers = self.receivers.lock();
            receivers
                .iter_mut()
                .filter(|(_, s)| s.counters.phase.is_active())
                .map(|(major, s)| {
                    s.counters.abort();
                    *major
                })
                .collect()
        };
        for major in aborted {
            self.emit(LinkEvent::TransferFailed {
                direction: Direction::Receive,
                major,
                reason: reason.to_string(),
            });
        }
        for tx in self.waiters.lock().values() {
            let _ = tx.send(AckSignal::Reset);
        }
        info!(reason, "All transfer sessions aborted");
    }

    // ------------------------------------------------------------------
    // Staged data
    // ------------------------------------------------------------------

    pub fn receive_status(&self, major: u8) -> Option<ReceiveStatus> {
        self.receivers.lock().get(&major).map(|s| ReceiveStatus {
            phase: s.counters.phase,
            expected_length: s.counters.expected_length,
            current_length: s.counters.current_length,
            staged: s.staging.len(),
        })
    }

    /// Bytes staged for `major`.
    pub fn received_data(&self, major: u8) -> Result<Vec<u8>, TransferError> {
        let mut receivers = self.receivers.lock();
        let session = receivers
            .get_mut(&major)
            .ok_or(TransferError::NoData { major })?;
        Ok(session.staging.read_all()?)
    }

    /// Copy the bytes staged for `major` to `path`.
    ///
    /// Not coordinated with an ongoing receive for the same key: call it once
    /// the transfer has completed.
    pub fn save_received(&self, major: u8, path: &Path) -> Result<u64, TransferError> {
        let mut receivers = self.receivers.lock();
        let session = receivers
            .get_mut(&major)
            .ok_or(TransferError::NoData { major })?;
        let active = session.counters.phase.is_active();
        let saved = session.staging.save_to(path);
        drop(receivers);
        if active {
            self.log(
                LogLevel::Warn,
                format!("Saved {:#04X} while a receive was still in progress", major),
            );
        }
        Ok(saved?)
    }
}

fn fold_digest(digest: &mut Option<ChainedChecksum>, chunk: &[u8]) {
    let failed = match digest {
        Some(d) => d.update(chunk).err(),
        None => None,
    };
    if let Some(e) = failed {
        debug!(error = %e, "Digest dropped");
        *digest = None;
    }
}
