//! TCP client transport.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::link::{LinkCore, spawn_reader};
use super::traits::{LinkObserver, LinkState, Transport, TransportError};

/// TCP endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl TcpSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// TCP transport.
///
/// `open` returns `Connecting` immediately; `Connected` is reported through
/// the observer once the connect completes on a worker thread.
pub struct TcpTransport {
    settings: TcpSettings,
    core: Arc<LinkCore>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    alive: Mutex<Option<Arc<AtomicBool>>>,
}

impl TcpTransport {
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            settings,
            core: Arc::new(LinkCore::new()),
            stream: Arc::new(Mutex::new(None)),
            alive: Mutex::new(None),
        }
    }

    /// Stop the reader without letting it report the disconnect.
    fn detach(&self) {
        if let Some(alive) = self.alive.lock().take() {
            alive.store(false, Ordering::Release);
        }
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn resolve(settings: &TcpSettings) -> std::io::Result<Vec<SocketAddr>> {
    Ok((settings.host.as_str(), settings.port)
        .to_socket_addrs()?
        .collect())
}

fn connect(settings: &TcpSettings) -> std::io::Result<TcpStream> {
    let timeout = Duration::from_millis(settings.connect_timeout_ms);
    let mut last_err = None;
    for addr in resolve(settings)? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

impl Transport for TcpTransport {
    #[instrument(skip(self), fields(host = %self.settings.host, port = self.settings.port))]
    fn open(&self) -> LinkState {
        match self.core.state() {
            LinkState::Disconnected => {}
            other => return other,
        }

        let alive = Arc::new(AtomicBool::new(true));
        *self.alive.lock() = Some(alive.clone());
        self.core.set_state(LinkState::Connecting);

        let settings = self.settings.clone();
        let core = self.core.clone();
        let slot = self.stream.clone();
        let spawned = thread::Builder::new()
            .name(format!("tcp-connect:{}", settings.host))
            .spawn(move || {
                let stream = match connect(&settings) {
                    Ok(s) => s,
                    Err(e) => {
                        if alive.swap(false, Ordering::AcqRel) {
                            warn!(host = %settings.host, port = settings.port, error = %e, "TCP connect failed");
                            core.report_state(LinkState::Disconnected);
                        }
                        return;
                    }
                };
                let _ = stream.set_nodelay(true);

                let reader = stream.try_clone().and_then(|mut reader| {
                    spawn_reader(
                        format!("tcp:{}:{}", settings.host, settings.port),
                        core.clone(),
                        alive.clone(),
                        true,
                        move |buf| reader.read(buf),
                    )
                });
                if let Err(e) = reader {
                    if alive.swap(false, Ordering::AcqRel) {
                        warn!(error = %e, "TCP reader setup failed");
                        core.report_state(LinkState::Disconnected);
                    }
                    return;
                }

                // close() may have run while connecting.
                let mut guard = slot.lock();
                if !alive.load(Ordering::Acquire) {
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
                *guard = Some(stream);
                drop(guard);
                info!(host = %settings.host, port = settings.port, "TCP connected");
                core.set_state(LinkState::Connected);
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Failed to start connect thread");
            self.alive.lock().take();
            self.core.report_state(LinkState::Disconnected);
            return LinkState::Disconnected;
        }
        LinkState::Connecting
    }

    fn close(&self) {
        // Detach first so the reader's EOF does not notify a second time.
        self.detach();
        self.core.set_state(LinkState::Disconnected);
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let result = self.core.with_write(|| {
            let mut guard = self.stream.lock();
            let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;
            stream
                .write_all(data)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
            Ok(data.len())
        });
        if let Err(TransportError::WriteFailed(msg)) = &result {
            warn!(error = %msg, "TCP write failed, dropping link");
            self.detach();
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
        format!("tcp:{}:{}", self.settings.host, self.settings.port)
    }
}
