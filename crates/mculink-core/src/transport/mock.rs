//! In-memory transport for testing.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::link::LinkCore;
use super::traits::{LinkObserver, LinkState, Transport, TransportError};

/// Mock transport for unit testing controller and session logic.
///
/// Writes are captured and, when the transport is paired, delivered to the
/// peer's observer as if they had arrived on the wire.
pub struct MockTransport {
    core: Arc<LinkCore>,
    /// Captured writes.
    write_log: Mutex<Vec<Vec<u8>>>,
    /// Number of upcoming writes to lose in transit.
    drop_next: Mutex<usize>,
    peer: Mutex<Weak<MockTransport>>,
    name: String,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            core: Arc::new(LinkCore::new()),
            write_log: Mutex::new(Vec::new()),
            drop_next: Mutex::new(0),
            peer: Mutex::new(Weak::new()),
            name: name.into(),
        }
    }

    /// Two transports wired back to back.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::named("mock-a"));
        let b = Arc::new(Self::named("mock-b"));
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    /// Deliver bytes to this transport's observer as if received.
    pub fn inject(&self, data: &[u8]) {
        self.core.deliver(data);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().clear();
    }

    /// Lose the next `n` writes: they are logged but never reach the peer.
    pub fn drop_next_writes(&self, n: usize) {
        *self.drop_next.lock() = n;
    }

    /// Simulate the link going down.
    pub fn disconnect(&self) {
        self.core.set_state(LinkState::Disconnected);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn open(&self) -> LinkState {
        self.core.set_state(LinkState::Connected);
        LinkState::Connected
    }

    fn close(&self) {
        self.core.set_state(LinkState::Disconnected);
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.core.with_write(|| {
            if self.core.state() != LinkState::Connected {
                return Err(TransportError::NotConnected);
            }
            self.write_log.lock().push(data.to_vec());

            let lost = {
                let mut drop_next = self.drop_next.lock();
                if *drop_next > 0 {
                    *drop_next -= 1;
                    true
                } else {
                    false
                }
            };
            if !lost && let Some(peer) = self.peer.lock().upgrade() {
                peer.inject(data);
            }
            Ok(data.len())
        })
    }

    fn state(&self) -> LinkState {
        self.core.state()
    }

    fn set_observer(&self, observer: Arc<dyn LinkObserver>) {
        self.core.set_observer(observer);
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
