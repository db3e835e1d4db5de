//! Serial port transport built on the `serialport` crate.
//!
//! Settings use the numeric conventions of common serial widgets:
//! parity 0 none, 2 even, 3 odd, 4 space, 5 mark; stop bits 1 one, 2 two,
//! 3 one-and-a-half; flow control 0 none, 1 software, 2 hardware.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{info, instrument, warn};

use super::link::{LinkCore, spawn_reader};
use super::traits::{LinkObserver, LinkState, Transport, TransportError};

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub flow_control: u8,
    #[serde(default)]
    pub parity: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Poll interval of the reader thread.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_read_timeout_ms() -> u64 {
    50
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            data_bits: default_data_bits(),
            flow_control: 0,
            parity: 0,
            stop_bits: default_stop_bits(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl SerialSettings {
    /// Check the settings without touching any hardware.
    pub fn validate(&self) -> Result<(), TransportError> {
        let invalid = |msg: String| Err(TransportError::InvalidSettings(msg));
        if self.port.is_empty() {
            return invalid("port name is empty".into());
        }
        if self.baud_rate == 0 {
            return invalid("baud rate is zero".into());
        }
        if !(5..=8).contains(&self.data_bits) {
            return invalid(format!("data bits {} not in 5..=8", self.data_bits));
        }
        if self.flow_control > 2 {
            return invalid(format!("flow control {} not in 0..=2", self.flow_control));
        }
        if self.parity > 5 || self.parity == 1 {
            return invalid(format!("parity {} not in {{0, 2, 3, 4, 5}}", self.parity));
        }
        if !(1..=3).contains(&self.stop_bits) {
            return invalid(format!("stop bits {} not in 1..=3", self.stop_bits));
        }
        Ok(())
    }

    fn builder(&self) -> Result<serialport::SerialPortBuilder, TransportError> {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let flow_control = match self.flow_control {
            0 => FlowControl::None,
            1 => FlowControl::Software,
            _ => FlowControl::Hardware,
        };
        let parity = match self.parity {
            0 => Parity::None,
            2 => Parity::Even,
            3 => Parity::Odd,
            other => {
                return Err(TransportError::InvalidSettings(format!(
                    "parity {} (space/mark) is not supported by this platform backend",
                    other
                )));
            }
        };
        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            _ => {
                return Err(TransportError::InvalidSettings(
                    "1.5 stop bits are not supported by this platform backend".into(),
                ));
            }
        };

        Ok(serialport::new(self.port.as_str(), self.baud_rate)
            .data_bits(data_bits)
            .flow_control(flow_control)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(self.read_timeout_ms)))
    }
}

/// Serial transport.
///
/// Invalid settings are detected at construction; such an instance never
/// touches hardware and every `open` reports `Disconnected`.
pub struct SerialTransport {
    settings: SerialSettings,
    invalid: Option<String>,
    core: Arc<LinkCore>,
    port: Mutex<Option<Box<dyn SerialPort>>>,
    alive: Mutex<Option<Arc<AtomicBool>>>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        let invalid = match settings.validate() {
            Ok(()) => None,
            Err(e) => {
                warn!(port = %settings.port, error = %e, "Serial settings rejected");
                Some(e.to_string())
            }
        };
        Self {
            settings,
            invalid,
            core: Arc::new(LinkCore::new()),
            port: Mutex::new(None),
            alive: Mutex::new(None),
        }
    }

    /// Whether construction-time validation passed.
    pub fn is_usable(&self) -> bool {
        self.invalid.is_none()
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn fail_open(&self, reason: &str) -> LinkState {
        warn!(port = %self.settings.port, reason, "Serial open failed");
        self.core.report_state(LinkState::Disconnected);
        LinkState::Disconnected
    }

    fn drop_link(&self) {
        if let Some(alive) = self.alive.lock().take() {
            alive.store(false, Ordering::Release);
        }
        self.port.lock().take();
    }
}

impl Transport for SerialTransport {
    #[instrument(skip(self), fields(port = %self.settings.port))]
    fn open(&self) -> LinkState {
        if let Some(reason) = &self.invalid {
            return self.fail_open(reason);
        }
        if self.core.state() == LinkState::Connected {
            return LinkState::Connected;
        }

        let builder = match self.settings.builder() {
            Ok(b) => b,
            Err(e) => return self.fail_open(&e.to_string()),
        };
        let port = match builder.open() {
            Ok(p) => p,
            Err(e) => return self.fail_open(&e.to_string()),
        };
        let mut reader = match port.try_clone() {
            Ok(r) => r,
            Err(e) => return self.fail_open(&e.to_string()),
        };

        let alive = Arc::new(AtomicBool::new(true));
        if let Err(e) = spawn_reader(
            format!("serial:{}", self.settings.port),
            self.core.clone(),
            alive.clone(),
            false,
            move |buf| reader.read(buf),
        ) {
            return self.fail_open(&e.to_string());
        }

        *self.port.lock() = Some(port);
        *self.alive.lock() = Some(alive);
        info!(baud = self.settings.baud_rate, "Serial port opened");
        self.core.set_state(LinkState::Connected);
        LinkState::Connected
    }

    fn close(&self) {
        self.drop_link();
        self.core.set_state(LinkState::Disconnected);
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let result = self.core.with_write(|| {
            let mut guard = self.port.lock();
            let port = guard.as_mut().ok_or(TransportError::NotConnected)?;
            port.write_all(data)
                .and_then(|_| port.flush())
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
            Ok(data.len())
        });
        if let Err(TransportError::WriteFailed(msg)) = &result {
            warn!(port = %self.settings.port, error = %msg, "Serial write failed, dropping link");
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
        format!("serial:{}@{}", self.settings.port, self.settings.baud_rate)
    }
}
