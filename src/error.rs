//! # Error Types
//!
//! Error taxonomy for the collar firmware core using `thiserror`.
//!
//! Only [`CollarError::SequenceExhausted`] is fatal to the control loop. Every
//! other error is logged, counted, or turned into a retry by the component that
//! observes it.

use thiserror::Error;

use crate::sample::SequenceNumber;

/// Main error type for the collar firmware
#[derive(Debug, Error)]
pub enum CollarError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistent storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wire format errors
    #[error("Telemetry codec error: {0}")]
    Codec(#[from] CodecError),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// The persisted sequence number space has run out
    #[error("Sequence number space exhausted")]
    SequenceExhausted,
}

/// Sensor acquisition errors (transient, recorded as a gap)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor read timed out")]
    Timeout,

    #[error("no driver installed for {0}")]
    NotPresent(&'static str),

    #[error("sensor not ready")]
    NotReady,

    #[error("sensor bus error: {0}")]
    Bus(String),
}

/// Radio link errors (trigger backoff, never fatal)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link timed out")]
    Timeout,

    #[error("negative acknowledgement received")]
    NakReceived,

    #[error("link disconnected")]
    Disconnected,

    #[error("modem error: {0}")]
    Modem(String),
}

/// Flash and persisted-state errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("access out of bounds: block {block}, offset {offset}, len {len}")]
    OutOfBounds { block: usize, offset: usize, len: usize },

    #[error("record of {len} bytes exceeds slot capacity {max}")]
    RecordTooLarge { len: usize, max: usize },

    #[error("corrupted record in block {block}: {reason}")]
    Corruption { block: usize, reason: String },

    #[error("flash I/O failed: {0}")]
    Io(String),

    #[error("record serialization failed: {0}")]
    Serialization(String),
}

/// Local buffer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Every slot is in flight; the sample was dropped and counted
    #[error("buffer full of in-flight slots, dropped sample {seq}")]
    Full { seq: SequenceNumber },

    /// Flash access failed. On append, `evicted` is the Pending sample whose
    /// slot was already given up for the new one.
    #[error("{source}")]
    Storage {
        source: StorageError,
        evicted: Option<SequenceNumber>,
    },
}

impl From<StorageError> for BufferError {
    fn from(source: StorageError) -> Self {
        BufferError::Storage { source, evicted: None }
    }
}

/// Wire format errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("batch of {0} samples exceeds the 16-bit count field")]
    TooManySamples(usize),

    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("invalid sync byte: 0x{0:02X}")]
    BadSync(u8),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("unknown sample kind tag {0}")]
    UnknownKind(u8),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<postcard::Error> for StorageError {
    fn from(e: postcard::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type alias for the collar firmware
pub type Result<T> = std::result::Result<T, CollarError>;
