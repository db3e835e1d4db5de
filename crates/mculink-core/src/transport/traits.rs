//! Transport layer abstraction.
//!
//! Defines the `Transport` trait for byte-level communication with the
//! device, allowing different implementations (serial, TCP, UDP, mock).

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
        }
    }
}

/// Receiver of incoming bytes and state changes.
///
/// Called from the transport's reader thread while it holds the read lock.
pub trait LinkObserver: Send + Sync {
    fn on_bytes(&self, data: &[u8]);
    fn on_state(&self, state: LinkState);
}

/// Raw traffic captured by a [`DeferredObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Bytes(Vec<u8>),
    State(LinkState),
}

/// Observer that queues traffic for the controlling task instead of handling
/// it on the reader thread.
///
/// Handlers therefore run on a later turn of the consumer's loop, never inside
/// the transport call that produced the data.
pub struct DeferredObserver {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl DeferredObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl LinkObserver for DeferredObserver {
    fn on_bytes(&self, data: &[u8]) {
        let _ = self.tx.send(TransportEvent::Bytes(data.to_vec()));
    }

    fn on_state(&self, state: LinkState) {
        let _ = self.tx.send(TransportEvent::State(state));
    }
}

/// Abstract transport interface.
///
/// `open` never fails loudly: a transport that cannot connect reports
/// `Disconnected` through its observer. Reads are pushed to the observer;
/// writes are serialized by the transport's write lock.
pub trait Transport: Send + Sync {
    /// Start connecting. Returns the state reached synchronously.
    fn open(&self) -> LinkState;

    /// Disconnect and stop delivering data.
    fn close(&self);

    /// Write raw bytes.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Current connection state.
    fn state(&self) -> LinkState;

    fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Register the receiver of incoming bytes and state changes.
    fn set_observer(&self, observer: Arc<dyn LinkObserver>);

    /// Human readable endpoint description.
    fn name(&self) -> String;
}
