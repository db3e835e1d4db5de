//! Link session - high-level entry point for applications.
//!
//! A session owns one transport and runs a dispatch task that turns the
//! transport's byte stream into frames and routes them to the transfer
//! controller. Applications talk to it with three verbs: send a frame, send a
//! chunked transfer, and listen to [`LinkEvent`]s.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::{SessionConfig, TransferConfig};
use crate::events::{Direction, LinkEvent, LogLevel, Observer, TracingObserver};
use crate::protocol::{FrameCodec, FrameDecoder, is_reserved_major, is_transfer_minor};
use crate::transfer::{FrameSink, TransferController};
use crate::transport::{DeferredObserver, LinkState, Transport, TransportEvent};

/// A running link to one device.
pub struct LinkSession {
    transport: Arc<dyn Transport>,
    controller: Arc<TransferController>,
    state: watch::Receiver<LinkState>,
    dispatch: JoinHandle<()>,
}

impl LinkSession {
    /// Create a session with the default tracing observer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &SessionConfig) -> Result<Self> {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    /// Create a session reporting to a custom observer.
    pub fn with_observer(config: &SessionConfig, observer: Arc<dyn Observer>) -> Result<Self> {
        config.transfer.validate()?;
        let codec = config
            .checksum
            .codec()
            .context("Failed to set up checksum")?;
        let transport = config.transport.build();
        Ok(Self::with_transport(
            transport,
            codec,
            config.transfer.clone(),
            observer,
        ))
    }

    /// Create a session over an already constructed transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        codec: FrameCodec,
        transfer: TransferConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let codec = Arc::new(codec);
        let decoder = FrameDecoder::new(codec.clone(), transfer.frame_timeout());
        let sink = FrameSink::new(transport.clone(), codec, observer.clone());
        let controller = Arc::new(TransferController::new(sink, transfer, observer.clone()));

        let (deferred, rx) = DeferredObserver::new();
        transport.set_observer(deferred);
        let (state_tx, state) = watch::channel(transport.state());

        let dispatch = tokio::spawn(dispatch_loop(
            rx,
            decoder,
            controller.clone(),
            observer,
            state_tx,
        ));

        Self {
            transport,
            controller,
            state,
            dispatch,
        }
    }

    /// Start connecting. Returns the state reached synchronously.
    #[instrument(skip(self), fields(link = %self.transport.name()))]
    pub fn open(&self) -> LinkState {
        self.transport.open()
    }

    /// Open and wait until the link reports `Connected`.
    pub async fn connect(&self, wait: Duration) -> Result<()> {
        if self.open() == LinkState::Connected {
            return Ok(());
        }
        // The watch can lag the transport; it only signals that the live
        // state moved.
        let mut state = self.state.clone();
        let transport = &self.transport;
        let reached = tokio::time::timeout(wait, async {
            state
                .wait_for(|_| transport.state() != LinkState::Connecting)
                .await
                .map(|_| transport.state())
        })
        .await;
        match reached {
            Ok(Ok(LinkState::Connected)) => Ok(()),
            Ok(Ok(other)) => bail!("{} is {}", self.transport.name(), other),
            Ok(Err(_)) => bail!("{}: dispatch stopped", self.transport.name()),
            Err(_) => bail!(
                "Timeout connecting to {} after {}ms",
                self.transport.name(),
                wait.as_millis()
            ),
        }
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn state(&self) -> LinkState {
        self.transport.state()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn controller(&self) -> &Arc<TransferController> {
        &self.controller
    }

    /// Send a single application frame.
    ///
    /// Link-control keys are refused; use the transfer methods instead.
    pub fn send(&self, major: u8, minor: u8, payload: &[u8]) -> Result<()> {
        if is_reserved_major(major) || is_transfer_minor(minor) {
            bail!(
                "Key {:#04X}/{:#04X} is reserved for link control",
                major,
                minor
            );
        }
        self.controller.sink().send(major, minor, payload)?;
        Ok(())
    }

    /// Send `data` as a chunked transfer.
    pub async fn send_transfer(&self, major: u8, data: &[u8]) -> Result<()> {
        self.controller.send_transfer(major, data).await?;
        Ok(())
    }

    /// Send a file's contents as a chunked transfer.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn send_file(&self, major: u8, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        info!(len = data.len(), "Sending file");
        self.send_transfer(major, &data).await
    }

    pub fn send_keepalive(&self, major: u8) -> Result<()> {
        self.controller.send_keepalive(major)?;
        Ok(())
    }

    /// Abort all transfers on both ends.
    pub fn reset(&self) -> Result<()> {
        self.controller.reset()?;
        Ok(())
    }

    /// Bytes received so far under `major`.
    pub fn received_data(&self, major: u8) -> Result<Vec<u8>> {
        Ok(self.controller.received_data(major)?)
    }

    /// Write the bytes received under `major` to `path`.
    ///
    /// Do not call while a transfer for `major` is still arriving.
    pub fn save_received(&self, major: u8, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        self.controller
            .save_received(major, path)
            .with_context(|| format!("Failed to save to {}", path.display()))
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.transport.close();
        self.dispatch.abort();
    }
}

/// Turn transport traffic into frames and route them.
async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut decoder: FrameDecoder,
    controller: Arc<TransferController>,
    observer: Arc<dyn Observer>,
    state_tx: watch::Sender<LinkState>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Bytes(bytes) => {
                let dropped = decoder.dropped();
                let frames = decoder.push(&bytes);
                if decoder.dropped() > dropped {
                    observer.on_event(&LinkEvent::Log {
                        level: LogLevel::Warn,
                        message: format!(
                            "{} corrupted frame(s) dropped",
                            decoder.dropped() - dropped
                        ),
                    });
                }
                for frame in frames {
                    observer.on_event(&LinkEvent::Packet {
                        direction: Direction::Receive,
                        major: frame.major,
                        minor: frame.minor,
                        length: frame.payload.len(),
                    });
                    controller.handle_frame(&frame);
                }
            }
            TransportEvent::State(state) => {
                // A partial frame never survives a reconnect.
                decoder.reset();
                state_tx.send_replace(state);
                observer.on_event(&LinkEvent::StateChanged(state));
            }
        }
    }
    debug!("Dispatch loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::events::ChannelObserver;
    use crate::transport::MockTransport;
    use tempfile::tempdir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session(transport: Arc<MockTransport>) -> (LinkSession, UnboundedReceiver<LinkEvent>) {
        session_over(transport)
    }

    fn session_over(transport: Arc<dyn Transport>) -> (LinkSession, UnboundedReceiver<LinkEvent>) {
        let (observer, events) = ChannelObserver::new();
        let config = TransferConfig {
            max_chunk_size: 16,
            ack_timeout_ms: 200,
            ..Default::default()
        };
        let session = LinkSession::with_transport(
            transport,
            FrameCodec::with_seed(Checksum::Crc16, 0xFFFF),
            config,
            Arc::new(observer),
        );
        (session, events)
    }

    async fn next_matching(
        events: &mut UnboundedReceiver<LinkEvent>,
        pred: impl Fn(&LinkEvent) -> bool,
    ) -> LinkEvent {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if pred(&ev) {
                return ev;
            }
        }
    }

    #[tokio::test]
    async fn test_transfer_between_sessions() {
        let (a, b) = MockTransport::pair();
        let (host, _host_events) = session(a);
        let (device, mut device_events) = session(b);
        host.connect(Duration::from_secs(1)).await.unwrap();
        device.connect(Duration::from_secs(1)).await.unwrap();

        let payload: Vec<u8> = (0..100u8).collect();
        host.send_transfer(0x30, &payload).await.unwrap();

        let done = next_matching(&mut device_events, |e| {
            matches!(e, LinkEvent::TransferComplete { .. })
        })
        .await;
        let LinkEvent::TransferComplete { length, digest, .. } = done else {
            unreachable!()
        };
        assert_eq!(length, 100);
        let expected = Checksum::Crc16.compute(&payload, &[0xFF, 0xFF]).unwrap();
        assert_eq!(digest, Some(expected));
        assert_eq!(device.received_data(0x30).unwrap(), payload);

        let dir = tempdir().unwrap();
        let out = dir.path().join("rx.bin");
        assert_eq!(device.save_received(0x30, &out).unwrap(), 100);
        assert_eq!(std::fs::read(out).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_application_frames_reach_peer() {
        let (a, b) = MockTransport::pair();
        let (host, _) = session(a);
        let (device, mut device_events) = session(b);
        host.open();
        device.open();

        host.send(0x01, 0x02, &[0xAA, 0xBB]).unwrap();
        let ev = next_matching(&mut device_events, |e| matches!(e, LinkEvent::Received { .. })).await;
        let LinkEvent::Received {
            major,
            minor,
            payload,
        } = ev
        else {
            unreachable!()
        };
        assert_eq!((major, minor), (0x01, 0x02));
        assert_eq!(payload.as_ref(), &[0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_send_refuses_control_keys() {
        let (a, _b) = MockTransport::pair();
        let (host, _) = session(a.clone());
        host.open();

        assert!(host.send(crate::protocol::DEV_READY, 0x01, &[]).is_err());
        assert!(host.send(crate::protocol::RESET, 0x01, &[]).is_err());
        assert!(host.send(0x01, crate::protocol::DATA, &[]).is_err());
        assert!(host.send(0x01, crate::protocol::SET_TRANS_SIZE, &[]).is_err());
        assert!(a.get_writes().is_empty());
    }

    #[tokio::test]
    async fn test_state_changes_are_reported() {
        let (a, _b) = MockTransport::pair();
        let (host, mut events) = session(a.clone());
        host.open();
        next_matching(&mut events, |e| {
            matches!(e, LinkEvent::StateChanged(LinkState::Connected))
        })
        .await;

        a.disconnect();
        next_matching(&mut events, |e| {
            matches!(e, LinkEvent::StateChanged(LinkState::Disconnected))
        })
        .await;
        assert!(host.send(0x01, 0x01, &[]).is_err());
    }

    async fn tcp_connect(runtime: &str) {
        use crate::transport::{TcpSettings, TcpTransport};
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf);
        });

        let (session, _) = session_over(Arc::new(TcpTransport::new(TcpSettings::new(
            "127.0.0.1",
            port,
        ))));
        session
            .connect(Duration::from_secs(2))
            .await
            .unwrap_or_else(|e| panic!("{}: {:#}", runtime, e));
        assert_eq!(session.state(), LinkState::Connected);
        session.close();
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_connect_over_tcp() {
        tcp_connect("current thread").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connect_over_tcp_repeatedly() {
        for _ in 0..10 {
            tcp_connect("multi thread").await;
        }
    }

    #[tokio::test]
    async fn test_connect_refused_over_tcp() {
        use crate::transport::{TcpSettings, TcpTransport};
        use std::net::TcpListener;

        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (session, _) = session_over(Arc::new(TcpTransport::new(TcpSettings::new(
            "127.0.0.1",
            port,
        ))));
        let err = session.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("Disconnected"), "{:#}", err);
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_reported() {
        let (a, _b) = MockTransport::pair();
        let (host, mut events) = session(a.clone());
        host.open();

        let codec = FrameCodec::with_seed(Checksum::Crc16, 0xFFFF);
        let mut bad = codec.encode_to_vec(0x01, 0x02, &[1, 2, 3]).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        a.inject(&bad);
        a.inject(&codec.encode_to_vec(0x01, 0x03, &[4]).unwrap());

        let ev = next_matching(&mut events, |e| matches!(e, LinkEvent::Log { .. })).await;
        let LinkEvent::Log { level, message } = ev else {
            unreachable!()
        };
        assert_eq!(level, LogLevel::Warn);
        assert!(message.starts_with("1 corrupted"), "{}", message);
        next_matching(&mut events, |e| {
            matches!(e, LinkEvent::Received { minor: 0x03, .. })
        })
        .await;
    }

    #[tokio::test]
    async fn test_send_file() {
        let (a, b) = MockTransport::pair();
        let (host, _) = session(a);
        let (device, mut device_events) = session(b);
        host.open();
        device.open();

        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![0x5A; 40]).unwrap();
        host.send_file(0x40, &path).await.unwrap();

        next_matching(&mut device_events, |e| {
            matches!(e, LinkEvent::TransferComplete { length: 40, .. })
        })
        .await;
        assert_eq!(device.received_data(0x40).unwrap(), vec![0x5A; 40]);

        assert!(host.send_file(0x40, dir.path().join("missing")).await.is_err());
    }
}
