//! CatPrinter BLE driver: print text to MXW01 thermal printers.
//!
//! Main modules:
//! - ble: btleplug transport binding and scanning
//! - connection: BLE session state machine
//! - printer: print session orchestration, the public driver
//! - protocol: command framing, CRC-8, GATT identifiers
//! - bitmap: monochrome rasters and 1bpp packing
//! - font: text rasterization
//! - transport: GATT contracts implemented by transport bindings
//! - events, config, error: driver events, tunables, error types

pub mod ble;
pub mod bitmap;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod font;
pub mod printer;
pub mod protocol;
pub mod transport;

/// BLE API: scan/connect to printers
pub use ble::{connect, scan, BtleAdapter, DeviceInfo};
pub use bitmap::{PackedBitmap, Raster};
pub use config::{DriverConfig, PRINTER_WIDTH};
pub use connection::ConnectionState;
pub use error::{Error, Result};
pub use events::{FailureKind, PrinterEvent};
pub use font::{Alignment, FontBook, TextStyle, Typeface, TtfTypeface};
/// Driver API
pub use printer::CatPrinter;
/// Protocol utilities (packets, checksums)
pub use protocol::{build_control_packet, crc8};
