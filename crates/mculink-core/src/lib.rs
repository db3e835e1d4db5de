//! mculink-core: packet link between a host and microcontroller firmware.
//!
//! Structured command/data frames travel over an interchangeable transport
//! (serial, TCP, UDP). Payloads larger than one frame are moved as chunked
//! transfers with per-chunk acknowledgment, retry and timeout.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: byte-level links with a shared locking and notification contract
//! - **Checksum**: CRC-8, CRC-16 and external helper checksums with chaining
//! - **Protocol**: frame format, control keys, stream reassembly
//! - **Transfer**: chunked send/receive state machine with backpressure
//! - **Device**: the firmware end of the link, with fixed-size buffers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use mculink_core::config::SessionConfig;
//! use mculink_core::session::LinkSession;
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = SessionConfig::load_from_file("link.toml")?;
//! let session = LinkSession::new(&config)?;
//! session.connect(Duration::from_secs(3)).await?;
//! session.send(0x01, 0x01, &[1])?;
//! session.send_file(0x20, "firmware.bin").await?;
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod config;
pub mod device;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use checksum::{ChainedChecksum, Checksum, ChecksumError, ExternalChecksum};
pub use config::{ChecksumAlgorithm, ChecksumConfig, ConfigError, SessionConfig, TransferConfig};
pub use device::{CommandTable, DeviceHandler, Dispatcher, DispatcherOptions};
pub use events::{
    ChannelObserver, Direction, LinkEvent, LogLevel, NullObserver, Observer, TracingObserver,
};
pub use protocol::{Endianness, Frame, FrameCodec, FrameDecoder, FrameError};
pub use session::LinkSession;
pub use transfer::{TransferController, TransferError};
pub use transport::{
    LinkState, MockTransport, SerialSettings, SerialTransport, TcpSettings, TcpTransport,
    Transport, TransportError, TransportSettings, UdpSettings, UdpTransport,
};
