//! State and locking shared by every transport implementation.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, warn};

use super::traits::{LinkObserver, LinkState};

/// Size of the per-read buffer used by reader threads.
const READ_BUF_SIZE: usize = 1024;

/// Connection state, observer registration and the read/write lock pair.
///
/// The two locks are independent, so a write can proceed while a read is
/// being delivered, but two writes (or two deliveries) never overlap. Both are
/// reentrant: a flow that already holds one may take it again.
pub struct LinkCore {
    state: Mutex<LinkState>,
    observer: RwLock<Option<Arc<dyn LinkObserver>>>,
    read_lock: ReentrantMutex<()>,
    write_lock: ReentrantMutex<()>,
}

impl LinkCore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::Disconnected),
            observer: RwLock::new(None),
            read_lock: ReentrantMutex::new(()),
            write_lock: ReentrantMutex::new(()),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Update the state, notifying the observer if it changed.
    pub fn set_state(&self, state: LinkState) {
        let changed = {
            let mut current = self.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.notify_state(state);
        }
    }

    /// Update the state and notify even if it did not change.
    ///
    /// Used for failed opens, which must be reported as a disconnect event.
    pub fn report_state(&self, state: LinkState) {
        *self.state.lock() = state;
        self.notify_state(state);
    }

    fn notify_state(&self, state: LinkState) {
        if let Some(observer) = self.observer() {
            observer.on_state(state);
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn LinkObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn observer(&self) -> Option<Arc<dyn LinkObserver>> {
        self.observer.read().clone()
    }

    /// Hand received bytes to the observer under the read lock.
    pub fn deliver(&self, data: &[u8]) {
        let _guard = self.read_lock.lock();
        if let Some(observer) = self.observer() {
            observer.on_bytes(data);
        }
    }

    /// Run `f` under the write lock.
    pub fn with_write<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.write_lock.lock();
        f()
    }
}

impl Default for LinkCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a thread that pulls bytes with `read` and delivers them to `core`.
///
/// The thread runs while `alive` is set. Clearing `alive` before tearing the
/// connection down suppresses the disconnect notification the reader would
/// otherwise emit when its read fails. When `zero_read_closes` is set a
/// zero-length read is treated as end of stream.
pub fn spawn_reader<F>(
    name: String,
    core: Arc<LinkCore>,
    alive: Arc<AtomicBool>,
    zero_read_closes: bool,
    mut read: F,
) -> io::Result<thread::JoinHandle<()>>
where
    F: FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
{
    thread::Builder::new().name(name.clone()).spawn(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        while alive.load(Ordering::Acquire) {
            match read(&mut buf) {
                Ok(0) if zero_read_closes => {
                    debug!(link = %name, "End of stream");
                    if alive.swap(false, Ordering::AcqRel) {
                        core.set_state(LinkState::Disconnected);
                    }
                    break;
                }
                Ok(0) => {}
                Ok(n) => core.deliver(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    if alive.swap(false, Ordering::AcqRel) {
                        warn!(link = %name, error = %e, "Read failed, dropping link");
                        core.set_state(LinkState::Disconnected);
                    }
                    break;
                }
            }
        }
        debug!(link = %name, "Reader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder {
        states: Mutex<Vec<LinkState>>,
        bytes: Mutex<Vec<u8>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
                bytes: Mutex::new(Vec::new()),
            })
        }
    }

    impl LinkObserver for Recorder {
        fn on_bytes(&self, data: &[u8]) {
            self.bytes.lock().extend_from_slice(data);
        }
        fn on_state(&self, state: LinkState) {
            self.states.lock().push(state);
        }
    }

    #[test]
    fn test_set_state_notifies_on_change_only() {
        let core = LinkCore::new();
        let rec = Recorder::new();
        core.set_observer(rec.clone());

        core.set_state(LinkState::Disconnected);
        core.set_state(LinkState::Connected);
        core.set_state(LinkState::Connected);
        core.report_state(LinkState::Connected);

        assert_eq!(*rec.states.lock(), vec![LinkState::Connected, LinkState::Connected]);
    }

    #[test]
    fn test_locks_are_reentrant() {
        let core = LinkCore::new();
        let nested = core.with_write(|| core.with_write(|| 42));
        assert_eq!(nested, 42);

        let rec = Recorder::new();
        core.set_observer(rec.clone());
        let _outer = core.read_lock.lock();
        core.deliver(b"x");
        assert_eq!(*rec.bytes.lock(), b"x".to_vec());
    }

    #[test]
    fn test_reader_delivers_then_reports_eof() {
        let core = Arc::new(LinkCore::new());
        let rec = Recorder::new();
        core.set_observer(rec.clone());
        core.set_state(LinkState::Connected);

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        tx.send(b"hello".to_vec()).unwrap();
        tx.send(Vec::new()).unwrap();
        let alive = Arc::new(AtomicBool::new(true));
        let handle = spawn_reader("test".into(), core.clone(), alive, true, move |buf| {
            let chunk = rx.recv_timeout(Duration::from_secs(1)).unwrap_or_default();
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        })
        .unwrap();
        handle.join().unwrap();

        assert_eq!(*rec.bytes.lock(), b"hello".to_vec());
        assert_eq!(core.state(), LinkState::Disconnected);
        assert_eq!(rec.states.lock().last(), Some(&LinkState::Disconnected));
    }

    #[test]
    fn test_cleared_alive_suppresses_disconnect() {
        let core = Arc::new(LinkCore::new());
        let rec = Recorder::new();
        core.set_observer(rec.clone());

        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let handle = spawn_reader("test".into(), core.clone(), alive, true, move |_buf| {
            flag.store(false, Ordering::Release);
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        })
        .unwrap();
        handle.join().unwrap();

        assert!(rec.states.lock().is_empty());
    }
}
