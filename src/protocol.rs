//! MXW01 wire protocol: GATT identifiers, command framing and CRC-8.
//!
//! Command frame layout:
//!
//! ```text
//! [0]=0x22 [1]=0x21 [2]=opcode [3]=0x00 [4..6]=len (LE16)
//! [6..6+len]=payload [6+len]=crc8(payload) [7+len]=0xFF
//! ```
//!
//! Bitmap data is not framed; it goes out as raw chunks on the data
//! characteristic.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Printer GATT service
pub const PRINTER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ae30_0000_1000_8000_00805f9b34fb);
/// Command characteristic (framed control packets)
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ae01_0000_1000_8000_00805f9b34fb);
/// Printer status notifications
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ae02_0000_1000_8000_00805f9b34fb);
/// Raw bitmap stream
pub const DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x0000ae03_0000_1000_8000_00805f9b34fb);
/// Client characteristic configuration descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const PREAMBLE: [u8; 2] = [0x22, 0x21];
pub const TERMINATOR: u8 = 0xFF;

/// Print intensity
pub const CMD_INTENSITY: u8 = 0xA2;
/// Print setup: row count + mode
pub const CMD_PRINT_SETUP: u8 = 0xA9;
/// End of job
pub const CMD_FINALIZE: u8 = 0xAD;

/// Computes CRC-8 for a byte slice (CatPrinter protocol).
///
/// Polynomial 0x07, initial value 0, no reflection, no final XOR.
pub fn crc8(data: &[u8]) -> u8 {
    let poly: u8 = 0x07;
    let mut crc: u8 = 0x00;

    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ poly;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Builds a control packet for the CatPrinter protocol.
///
/// - `opcode`: command byte, passed through unchecked
/// - `payload`: command payload, at most 65535 bytes
///
/// Returns the complete frame ready to write to the command characteristic.
pub fn build_control_packet(opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(PREAMBLE.len() + 4 + payload.len() + 2);
    out.extend_from_slice(&PREAMBLE);
    out.push(opcode);
    out.push(0x00);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out.push(crc8(payload));
    out.push(TERMINATOR);
    Ok(out)
}

/// Payload of the print-setup command: row count (LE16) then the trailer.
pub fn print_setup_payload(rows: u16, trailer: [u8; 2]) -> [u8; 4] {
    let [lo, hi] = rows.to_le_bytes();
    [lo, hi, trailer[0], trailer[1]]
}

/// Splits data into chunks of given size. The last chunk may be shorter.
pub fn chunk_data(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if chunk_size == 0 {
        return vec![data];
    }
    data.chunks(chunk_size).collect()
}

/// Lowercase hex dump used in trace logs.
pub(crate) fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}
