//! Error types for kflash.

use std::io;
use thiserror::Error;

/// Result type for kflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for kflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed SLIP escape sequence.
    #[error("Framing error: {0}")]
    Framing(String),

    /// No complete frame arrived before the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Response frame too short to carry an operation and a reason.
    #[error("Short response: {0} byte(s)")]
    ShortResponse(usize),

    /// The retry budget of a transaction was exhausted on transport errors.
    #[error("Device unresponsive during {operation} after {attempts} attempt(s)")]
    DeviceUnresponsive {
        /// Operation that was being attempted.
        operation: &'static str,
        /// Number of failed attempts.
        attempts: usize,
    },

    /// Unexpected operation/reason combination after retries were exhausted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// AES key is not 16, 24 or 32 bytes long.
    #[error("Invalid AES key size: {0} bytes")]
    InvalidKeySize(usize),

    /// Cipher input is not a single 16-byte block.
    #[error("Invalid block length: {0} bytes (expected 16)")]
    InvalidBlockLength(usize),

    /// Board auto-detection tried every reset profile without a greeting.
    #[error("Device not found or not in ISP mode")]
    DeviceNotFound,

    /// Firmware container cannot be used for the requested operation.
    #[error("Unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    /// Invalid `.kfpkg` package.
    #[error("Invalid KFPKG: {0}")]
    InvalidKfpkg(String),

    /// Invalid ELF file.
    #[error("Invalid ELF: {0}")]
    InvalidElf(String),

    /// Erase address or length out of range or misaligned.
    #[error("Invalid erase range: {0}")]
    InvalidEraseRange(String),

    /// A chunked write failed; `address` is the first byte not written.
    #[error("Write aborted at {address:#010x}: {source}")]
    WriteAborted {
        /// Address of the chunk that did not complete.
        address: u32,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Operation cancelled by the user.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error is a transport-level failure that the retry
    /// policy may recover from.
    pub(crate) fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Framing(_) | Self::ShortResponse(_) | Self::Io(_)
        )
    }
}
