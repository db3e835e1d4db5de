//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to follow link activity (received frames,
//! transfer progress, connection state) without coupling to the core logic.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport::LinkState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Direction of a transfer or packet, seen from this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This endpoint is sending.
    Send,
    /// This endpoint is receiving.
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "TX"),
            Direction::Receive => write!(f, "RX"),
        }
    }
}

/// Events emitted by a link session.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Transport connection state changed.
    StateChanged(LinkState),
    /// A frame addressed to the application arrived.
    Received { major: u8, minor: u8, payload: Bytes },
    /// Transfer progress for a major key.
    Progress {
        direction: Direction,
        major: u8,
        percent: u8,
        label: String,
    },
    /// A chunked transfer finished.
    TransferComplete {
        direction: Direction,
        major: u8,
        length: u32,
        /// Chained checksum over the whole transfer, if it could be computed.
        digest: Option<Vec<u8>>,
    },
    /// A chunked transfer was abandoned.
    TransferFailed {
        direction: Direction,
        major: u8,
        reason: String,
    },
    /// Frame sent/received on the wire.
    Packet {
        direction: Direction,
        major: u8,
        minor: u8,
        length: usize,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving link events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait Observer: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &LinkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: &LinkEvent) {}
}

/// Observer that forwards events into a channel.
///
/// The receiving side processes them on its own schedule, so UI work never
/// runs inside the protocol task.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn on_event(&self, event: &LinkEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::StateChanged(state) => {
                tracing::info!(state = %state, "Link state changed");
            }
            LinkEvent::Received {
                major,
                minor,
                payload,
            } => {
                tracing::debug!(
                    major = %format!("{:#04X}", major),
                    minor = %format!("{:#04X}", minor),
                    len = payload.len(),
                    "Frame received"
                );
            }
            LinkEvent::Progress {
                direction,
                major,
                percent,
                label,
            } => {
                tracing::debug!(dir = %direction, major, progress = %format!("{}%", percent), "{}", label);
            }
            LinkEvent::TransferComplete {
                direction,
                major,
                length,
                ..
            } => {
                tracing::info!(dir = %direction, major, length, "Transfer complete");
            }
            LinkEvent::TransferFailed {
                direction,
                major,
                reason,
            } => {
                tracing::error!(dir = %direction, major, "Transfer failed: {}", reason);
            }
            LinkEvent::Packet {
                direction,
                major,
                minor,
                length,
            } => {
                tracing::trace!(dir = %direction, major, minor, len = length, "Packet");
            }
            LinkEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_observer_forwards() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_event(&LinkEvent::StateChanged(LinkState::Connected));
        observer.on_event(&LinkEvent::Log {
            level: LogLevel::Info,
            message: "hello".into(),
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            LinkEvent::StateChanged(LinkState::Connected)
        ));
        assert!(matches!(rx.try_recv().unwrap(), LinkEvent::Log { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_event(&LinkEvent::StateChanged(LinkState::Disconnected));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Send.to_string(), "TX");
        assert_eq!(Direction::Receive.to_string(), "RX");
    }
}
