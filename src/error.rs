//! Error types for the printer driver

use thiserror::Error;

use crate::events::FailureKind;

/// Driver error types
#[derive(Debug, Error)]
pub enum Error {
    /// Bluetooth adapter missing or disabled
    #[error("Bluetooth unavailable: {0}")]
    TransportUnavailable(String),

    /// Target address could not be resolved to a peripheral
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Empty or malformed device address
    #[error("Invalid device address: {0:?}")]
    InvalidAddress(String),

    /// Ready state was not reached in time
    #[error("Connect timeout after {0} ms")]
    ConnectTimeout(u64),

    /// Printer service or characteristics missing
    #[error("Service discovery failed: {0}")]
    Discovery(String),

    /// Link dropped by the peer or the stack
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// Operation requires a ready connection
    #[error("Printer not connected")]
    NotConnected,

    /// Characteristic write rejected by the transport
    #[error("Write failed: {0}")]
    Write(String),

    /// Command payload does not fit the 16-bit length field
    #[error("Payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    /// Raster dimensions must be positive
    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Raster width differs from the printer's raster width
    #[error("Raster is {width} px wide, printer expects {expected} px")]
    RasterWidth { width: u32, expected: u32 },

    /// Row count does not fit the print-setup command
    #[error("Too many rows: {0} (max 65535)")]
    TooManyRows(u32),

    /// Typeface loading or lookup failure
    #[error("Font error: {0}")]
    Font(String),

    /// Invalid driver configuration
    #[error("Invalid config: {0}")]
    Config(String),

    /// Error surfaced by the btleplug stack
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

impl Error {
    /// Failure category reported on the event channel.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::TransportUnavailable(_) | Error::DeviceNotFound(_) | Error::Ble(_) => {
                FailureKind::TransportUnavailable
            }
            Error::ConnectTimeout(_) => FailureKind::ConnectTimeout,
            Error::Discovery(_) => FailureKind::Discovery,
            Error::LinkLost(_) => FailureKind::LinkLost,
            Error::NotConnected => FailureKind::NotConnected,
            Error::Write(_) => FailureKind::Print,
            Error::InvalidAddress(_)
            | Error::PayloadTooLarge(_)
            | Error::InvalidDimensions { .. }
            | Error::RasterWidth { .. }
            | Error::TooManyRows(_)
            | Error::Font(_)
            | Error::Config(_) => FailureKind::InvalidInput,
        }
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, Error>;
