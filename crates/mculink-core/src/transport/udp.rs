//! UDP transport.
//!
//! Datagrams are received on a server socket bound to `local_port` and sent
//! from a separate client socket bound to `client_port`. There is no
//! handshake: the link counts as connected once both sockets are bound.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::link::{LinkCore, spawn_reader};
use super::traits::{LinkObserver, LinkState, Transport, TransportError};

/// Poll interval of the server socket.
const RECV_POLL: Duration = Duration::from_millis(100);

/// UDP endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpSettings {
    pub remote_host: String,
    pub remote_port: u16,
    /// Port the server socket listens on.
    pub local_port: u16,
    /// Port the client socket sends from; 0 picks an ephemeral port.
    #[serde(default)]
    pub client_port: u16,
}

struct Sockets {
    client: UdpSocket,
    remote: SocketAddr,
    local: SocketAddr,
}

/// UDP transport.
pub struct UdpTransport {
    settings: UdpSettings,
    core: Arc<LinkCore>,
    sockets: Mutex<Option<Sockets>>,
    alive: Mutex<Option<Arc<AtomicBool>>>,
}

impl UdpTransport {
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            settings,
            core: Arc::new(LinkCore::new()),
            sockets: Mutex::new(None),
            alive: Mutex::new(None),
        }
    }

    /// Address the server socket is bound to, while open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sockets.lock().as_ref().map(|s| s.local)
    }

    /// Address the client socket sends from, while open.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.sockets
            .lock()
            .as_ref()
            .and_then(|s| s.client.local_addr().ok())
    }

    fn bind(&self, alive: Arc<AtomicBool>) -> std::io::Result<Sockets> {
        let remote = (self.settings.remote_host.as_str(), self.settings.remote_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "remote host resolved to no addresses")
            })?;

        let unspecified = if remote.is_ipv4() { "0.0.0.0" } else { "::" };
        let server = UdpSocket::bind((unspecified, self.settings.local_port))?;
        server.set_read_timeout(Some(RECV_POLL))?;
        let client = UdpSocket::bind((unspecified, self.settings.client_port))?;
        let local = server.local_addr()?;

        spawn_reader(
            format!("udp:{}", local),
            self.core.clone(),
            alive,
            false,
            move |buf| server.recv_from(buf).map(|(n, _)| n),
        )?;

        Ok(Sockets {
            client,
            remote,
            local,
        })
    }

    fn drop_link(&self) {
        if let Some(alive) = self.alive.lock().take() {
            alive.store(false, Ordering::Release);
        }
        self.sockets.lock().take();
    }
}

impl Transport for UdpTransport {
    #[instrument(skip(self), fields(remote = %self.settings.remote_host, local_port = self.settings.local_port))]
    fn open(&self) -> LinkState {
        if self.core.state() == LinkState::Connected {
            return LinkState::Connected;
        }

        let alive = Arc::new(AtomicBool::new(true));
        match self.bind(alive.clone()) {
            Ok(sockets) => {
                info!(local = %sockets.local, remote = %sockets.remote, "UDP sockets bound");
                *self.sockets.lock() = Some(sockets);
                *self.alive.lock() = Some(alive);
                self.core.set_state(LinkState::Connected);
                LinkState::Connected
            }
            Err(e) => {
                alive.store(false, Ordering::Release);
                warn!(error = %e, "UDP bind failed");
                self.core.report_state(LinkState::Disconnected);
                LinkState::Disconnected
            }
        }
    }

    fn close(&self) {
        self.drop_link();
        self.core.set_state(LinkState::Disconnected);
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let result = self.core.with_write(|| {
            let guard = self.sockets.lock();
            let sockets = guard.as_ref().ok_or(TransportError::NotConnected)?;
            sockets
                .client
                .send_to(data, sockets.remote)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))
        });
        if let Err(TransportError::WriteFailed(msg)) = &result {
            warn!(error = %msg, "UDP send failed, dropping link");
            self.drop_link();
            self.core.set_state(LinkState::Disconnected);
        }
        result
    }

    fn state(&self) -> LinkState {
        self.core.state()
    }

    fn set_observer(&self, observer: Arc<dyn LinkObserver>) {
        self.core.set_observer(observer);
    }

    fn name(&self) -> String {
        format!(
            "udp:{}:{}<-{}",
            self.settings.remote_host, self.settings.remote_port, self.settings.local_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeferredObserver;
    use crate::transport::traits::TransportEvent;
    use std::thread;

    #[test]
    fn test_udp_send_and_receive() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let transport = UdpTransport::new(UdpSettings {
            remote_host: "127.0.0.1".into(),
            remote_port: peer_port,
            local_port: 0,
            client_port: 0,
        });
        let (observer, mut rx) = DeferredObserver::new();
        transport.set_observer(observer);

        assert_eq!(transport.open(), LinkState::Connected);
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::State(LinkState::Connected));

        transport.write(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(Some(from.port()), transport.client_addr().map(|a| a.port()));

        let local_port = transport.local_addr().unwrap().port();
        peer.send_to(b"world", ("127.0.0.1", local_port)).unwrap();
        let mut got = None;
        for _ in 0..200 {
            if let Ok(ev) = rx.try_recv() {
                got = Some(ev);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(got, Some(TransportEvent::Bytes(b"world".to_vec())));

        transport.close();
        assert!(!transport.is_connected());
        assert!(transport.local_addr().is_none());
        assert!(matches!(
            transport.write(b"x").unwrap_err(),
            TransportError::NotConnected
        ));
    }

    #[test]
    fn test_unresolvable_remote_reports_disconnect() {
        let transport = UdpTransport::new(UdpSettings {
            remote_host: "host.invalid".into(),
            remote_port: 9,
            local_port: 0,
            client_port: 0,
        });
        let (observer, mut rx) = DeferredObserver::new();
        transport.set_observer(observer);

        assert_eq!(transport.open(), LinkState::Disconnected);
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::State(LinkState::Disconnected));
    }
}
