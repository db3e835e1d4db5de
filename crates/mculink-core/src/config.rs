//! Session configuration, stored as TOML.
//!
//! ```toml
//! [transport]
//! kind = "tcp"
//! host = "192.168.4.1"
//! port = 3333
//!
//! [checksum]
//! algorithm = "crc16"
//! seed = 0
//!
//! [transfer]
//! max_chunk_size = 128
//! ack_timeout_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::{Checksum, ChecksumError, ExternalChecksum};
use crate::protocol::{
    DEFAULT_ACK_TIMEOUT_MS, DEFAULT_FRAME_TIMEOUT_MS, DEFAULT_MAX_CHUNK, DEFAULT_PACKET_RETRIES,
    Endianness, FrameCodec, MAX_PAYLOAD,
};
use crate::transport::TransportSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Checksum setup failed: {0}")]
    Checksum(#[from] ChecksumError),
}

/// Checksum algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Crc8,
    Crc16,
    External,
}

/// Checksum section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    pub algorithm: ChecksumAlgorithm,
    /// Helper executable, required for `external`.
    pub external_path: Option<PathBuf>,
    /// Start value, projected onto the checksum width.
    pub seed: u32,
}

impl ChecksumConfig {
    /// Instantiate the algorithm. Queries the helper's width for `external`.
    pub fn build(&self) -> Result<Checksum, ConfigError> {
        match self.algorithm {
            ChecksumAlgorithm::Crc8 => Ok(Checksum::Crc8),
            ChecksumAlgorithm::Crc16 => Ok(Checksum::Crc16),
            ChecksumAlgorithm::External => {
                let path = self.external_path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("external checksum needs external_path".into())
                })?;
                Ok(Checksum::External(ExternalChecksum::new(path)?))
            }
        }
    }

    pub fn codec(&self) -> Result<FrameCodec, ConfigError> {
        Ok(FrameCodec::with_seed(self.build()?, self.seed))
    }
}

/// Chunked transfer section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per `DATA` frame, 1..=255.
    pub max_chunk_size: usize,
    pub ack_timeout_ms: u64,
    /// Resends per chunk after the first attempt.
    pub packet_retries: u8,
    /// Discard previously staged data when a new size is announced.
    pub clear_on_set: bool,
    /// Byte order of the `SET_TRANS_SIZE` length field.
    pub size_endianness: Endianness,
    pub frame_timeout_ms: u64,
    /// Directory for staging files; system temp dir if unset.
    pub staging_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            packet_retries: DEFAULT_PACKET_RETRIES,
            clear_on_set: true,
            size_endianness: Endianness::default(),
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            staging_dir: None,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PAYLOAD).contains(&self.max_chunk_size) {
            return Err(ConfigError::Invalid(format!(
                "max_chunk_size {} not in 1..={}",
                self.max_chunk_size, MAX_PAYLOAD
            )));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ack_timeout_ms is zero".into()));
        }
        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid("frame_timeout_ms is zero".into()));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Configuration for a link session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub transport: TransportSettings,
    #[serde(default)]
    pub checksum: ChecksumConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.transfer.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
