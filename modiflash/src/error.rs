//! Error types for modiflash.

use std::io;
use thiserror::Error;

/// Result type for modiflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for modiflash operations.
///
/// Every per-device failure is converted into one of these variants before it
/// reaches the batch orchestrator; a single device's error never aborts the
/// rest of the batch.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Incoming bytes did not form a parseable packet envelope.
    ///
    /// Dropped by the reader loop, never fatal.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A per-phase protocol timeout elapsed (discovery, ready-wait or
    /// command response).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The target never answered the discovery request.
    #[error("Module {0:#05x} did not respond")]
    NoResponse(u16),

    /// A session expected at least one target module and found none.
    #[error("No MODI modules found")]
    NoModulesFound,

    /// Erase or CRC verification exceeded its retry cap on a page.
    #[error("Flash operation failed: {0}")]
    FlashOperationFailed(String),

    /// The end-flash trailer could not be committed.
    #[error("End-flash trailer write failed: {0}")]
    TrailerWriteFailed(String),

    /// The device did not re-enumerate within the reconnect window.
    #[error("Reconnect timed out: {0}")]
    ReconnectTimeout(String),

    /// Invalid firmware image or version file.
    #[error("Invalid firmware: {0}")]
    InvalidFirmware(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session was cancelled by the embedding application.
    #[error("Update cancelled")]
    Cancelled,
}
