//! End-to-end transfers over in-memory links.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mculink_core::checksum::Checksum;
use mculink_core::device::{CommandTable, DeviceHandler, Dispatcher, DispatcherOptions};
use mculink_core::events::{ChannelObserver, LinkEvent, NullObserver};
use mculink_core::protocol::{DATA, FrameCodec, FrameDecoder, SET_TRANS_SIZE};
use mculink_core::transfer::TransferError;
use mculink_core::transport::{
    DeferredObserver, LinkObserver, LinkState, MockTransport, Transport, TransportError,
    TransportEvent,
};
use mculink_core::{LinkSession, TransferConfig};
use parking_lot::Mutex;

fn codec() -> FrameCodec {
    FrameCodec::with_seed(Checksum::Crc8, 0xFF)
}

fn transfer_config(ack_timeout_ms: u64) -> TransferConfig {
    TransferConfig {
        max_chunk_size: 128,
        ack_timeout_ms,
        ..Default::default()
    }
}

fn host(link: Arc<dyn Transport>, ack_timeout_ms: u64) -> LinkSession {
    LinkSession::with_transport(
        link,
        codec(),
        transfer_config(ack_timeout_ms),
        Arc::new(NullObserver),
    )
}

fn data_frames(link: &MockTransport) -> Vec<Vec<u8>> {
    let mut decoder = FrameDecoder::new(Arc::new(codec()), Duration::from_secs(60));
    link.get_writes()
        .iter()
        .flat_map(|w| decoder.push(w))
        .filter(|f| f.minor == DATA)
        .map(|f| f.payload.to_vec())
        .collect()
}

// ─── Simulated firmware ─────────────────────────────────────────────────────

struct Board {
    link: Arc<MockTransport>,
    data: Vec<u8>,
    completed: Vec<(u8, u32)>,
    led: Option<u8>,
}

impl DeviceHandler for Board {
    fn transmit(&mut self, bytes: &[u8]) {
        let _ = self.link.write(bytes);
    }

    fn on_data(&mut self, _major: u8, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    fn on_transfer_complete(&mut self, major: u8, length: u32) {
        self.completed.push((major, length));
    }
}

fn set_led(board: &mut Board, args: &[u8]) {
    board.led = Some(args[0]);
}

fn spawn_board(link: Arc<MockTransport>, symmetric_ack: bool) -> Arc<Mutex<Board>> {
    let (observer, mut rx) = DeferredObserver::new();
    link.set_observer(observer);
    link.open();

    let board = Arc::new(Mutex::new(Board {
        link,
        data: Vec::new(),
        completed: Vec::new(),
        led: None,
    }));
    let shared = board.clone();
    tokio::spawn(async move {
        let table = CommandTable::new().register(0x01, 0x01, 1, set_led);
        let mut dispatcher: Dispatcher<Board> = Dispatcher::new(
            &codec(),
            table,
            DispatcherOptions {
                symmetric_ack,
                ..Default::default()
            },
        );
        while let Some(event) = rx.recv().await {
            if let TransportEvent::Bytes(bytes) = event {
                dispatcher.push(&bytes, &mut shared.lock());
            }
        }
    });
    board
}

#[tokio::test]
async fn host_to_firmware_transfer() {
    let (a, b) = MockTransport::pair();
    let board = spawn_board(b, true);
    let session = host(a.clone(), 500);
    session.connect(Duration::from_secs(1)).await.unwrap();

    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    session.send_transfer(0x20, &payload).await.unwrap();

    let board = board.lock();
    assert_eq!(board.data, payload);
    assert_eq!(board.completed, vec![(0x20, 600)]);
    assert_eq!(data_frames(&a).len(), 5);
}

#[tokio::test]
async fn firmware_commands() {
    let (a, b) = MockTransport::pair();
    let board = spawn_board(b, false);
    let session = host(a, 500);
    session.open();

    session.send(0x01, 0x01, &[42]).unwrap();
    session.send(0x01, 0x01, &[1, 2]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(board.lock().led, Some(42));
}

#[tokio::test]
async fn silent_firmware_exhausts_retries() {
    let (a, b) = MockTransport::pair();
    let _board = spawn_board(b, false);
    let session = host(a.clone(), 30);
    session.open();

    let err = session
        .controller()
        .send_transfer(0x20, &[9u8; 200])
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Timeout { attempts: 3, .. }));

    // packet_retries + 1 identical copies of the first chunk, nothing more.
    let sent = data_frames(&a);
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|p| p == &vec![9u8; 128]));
}

// ─── Host to host with loss ─────────────────────────────────────────────────

/// Loses the write with the given index.
struct Lossy {
    inner: Arc<MockTransport>,
    writes: AtomicUsize,
    lose: usize,
}

impl Transport for Lossy {
    fn open(&self) -> LinkState {
        self.inner.open()
    }
    fn close(&self) {
        self.inner.close()
    }
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) == self.lose {
            self.inner.drop_next_writes(1);
        }
        self.inner.write(data)
    }
    fn state(&self) -> LinkState {
        self.inner.state()
    }
    fn set_observer(&self, observer: Arc<dyn LinkObserver>) {
        self.inner.set_observer(observer)
    }
    fn name(&self) -> String {
        format!("lossy:{}", self.inner.name())
    }
}

#[tokio::test]
async fn lost_chunk_is_resent() {
    let (a, b) = MockTransport::pair();
    // Write 0 is SET_TRANS_SIZE, write 1 the first chunk.
    let sender = host(
        Arc::new(Lossy {
            inner: a.clone(),
            writes: AtomicUsize::new(0),
            lose: 1,
        }),
        50,
    );
    let (observer, mut events) = ChannelObserver::new();
    let receiver = LinkSession::with_transport(
        b,
        codec(),
        transfer_config(50),
        Arc::new(observer),
    );
    sender.open();
    receiver.open();

    let payload: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
    sender.send_transfer(0x33, &payload).await.unwrap();
    assert_eq!(receiver.received_data(0x33).unwrap(), payload);

    let sent = data_frames(&a);
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0], sent[1]);

    let mut completions = 0;
    while let Ok(ev) = events.try_recv() {
        if matches!(ev, LinkEvent::TransferComplete { major: 0x33, length: 300, .. }) {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);

    let mut decoder = FrameDecoder::new(Arc::new(codec()), Duration::from_secs(60));
    let first = a.get_writes().iter().flat_map(|w| decoder.push(w)).next().unwrap();
    assert_eq!(first.minor, SET_TRANS_SIZE);
}
