//! Error types for uartota.

use {
    crate::{flash::FlashError, protocol::ErrorCode, protocol::frame::FrameError},
    std::io,
    thiserror::Error,
};

/// Result type for uartota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uartota operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A frame could not be encoded or decoded.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// The partition backend reported a failure.
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The peer sent something that does not fit the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with a NACK.
    #[error("Device rejected {context}: {code}")]
    Rejected {
        /// Error code carried by the NACK.
        code: ErrorCode,
        /// What was being attempted.
        context: String,
    },

    /// Firmware image is malformed.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application asked the operation to stop.
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Returns the NACK error code if the device rejected the request.
    pub fn rejection_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
