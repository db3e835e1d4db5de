//! Transport layer module.

pub mod link;
pub mod mock;
pub mod serial;
pub mod tcp;
pub mod traits;
pub mod udp;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use link::LinkCore;
pub use mock::MockTransport;
pub use serial::{SerialSettings, SerialTransport};
pub use tcp::{TcpSettings, TcpTransport};
pub use traits::{
    DeferredObserver, LinkObserver, LinkState, Transport, TransportError, TransportEvent,
};
pub use udp::{UdpSettings, UdpTransport};

/// Which physical link to use, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSettings {
    Serial(SerialSettings),
    Tcp(TcpSettings),
    Udp(UdpSettings),
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings::Serial(SerialSettings::default())
    }
}

impl TransportSettings {
    /// Build the transport. The result is not opened yet.
    pub fn build(&self) -> Arc<dyn Transport> {
        match self {
            TransportSettings::Serial(s) => Arc::new(SerialTransport::new(s.clone())),
            TransportSettings::Tcp(s) => Arc::new(TcpTransport::new(s.clone())),
            TransportSettings::Udp(s) => Arc::new(UdpTransport::new(s.clone())),
        }
    }
}
