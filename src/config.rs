//! Driver configuration.
//!
//! Every protocol timing and opaque payload byte lives here. The defaults are
//! the values the MXW01 firmware is known to accept; tests shorten the timings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Printer raster width in pixels (48 bytes per row)
pub const PRINTER_WIDTH: u32 = 384;

/// Tunables for one driver instance.
///
/// Durations are stored in milliseconds so the struct maps 1:1 to JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Raster width the printer expects, in pixels
    pub printer_width: u32,
    /// Bound on the whole connect sequence (link + discovery)
    pub connect_timeout_ms: u64,
    /// How often `connect` re-checks the connection state
    pub connect_poll_ms: u64,
    /// Bytes per raw bitmap write on the data characteristic
    pub chunk_size: usize,
    /// Pause after every bitmap chunk
    pub chunk_delay_ms: u64,
    /// Pause after every framed command
    pub command_delay_ms: u64,
    /// Payload of the intensity command (0x5D is roughly 90%)
    pub intensity: u8,
    /// Trailing bytes of the print-setup command, after the row count
    pub print_setup_trailer: [u8; 2],
    /// Payload of the finalize command
    pub finalize_payload: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            printer_width: PRINTER_WIDTH,
            connect_timeout_ms: 15_000,
            connect_poll_ms: 100,
            chunk_size: 20,
            chunk_delay_ms: 10,
            command_delay_ms: 50,
            intensity: 0x5D,
            print_setup_trailer: [0x30, 0x00],
            finalize_payload: 0x00,
        }
    }
}

impl DriverConfig {
    /// Parse a JSON override; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON override from disk.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Reject values the driver cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.printer_width == 0 {
            return Err(Error::Config("printer_width must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if self.connect_poll_ms == 0 {
            return Err(Error::Config("connect_poll_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }
}
