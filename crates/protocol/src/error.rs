//! Protocol error types

use std::fmt;
use thiserror::Error;

/// Which part of a bulk frame was being read when the stream ran dry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStage {
    /// The 4-byte length prefix
    Header,
    /// The payload following the length prefix
    Payload,
}

impl fmt::Display for ReadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadStage::Header => f.write_str("length header"),
            ReadStage::Payload => f.write_str("payload"),
        }
    }
}

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended or failed before a full header/payload was read
    #[error("Short read on {stage}: received {received} of {expected} bytes")]
    ShortRead {
        stage: ReadStage,
        expected: usize,
        received: usize,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Length field smaller than the header it includes
    #[error("Invalid frame length {length}: must be at least 4")]
    InvalidLength { length: u32 },

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Peer sent something other than an SP header
    #[error("Invalid SP handshake header: {header:02x?}")]
    InvalidHandshake { header: [u8; 8] },

    /// Peer speaks a protocol we cannot pair with
    #[error("Incompatible SP peer protocol {actual:#06x} (expected {expected:#06x})")]
    IncompatiblePeer { actual: u16, expected: u16 },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the error means the underlying stream stopped delivering bytes
    pub fn is_short_read(&self) -> bool {
        matches!(self, ProtocolError::ShortRead { .. })
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
