//! Monochrome rasters and the printer's packed 1bpp bitmap format.

use crate::error::{Error, Result};

/// A width x height grid of black/white pixels, row-major.
///
/// Pixels are classified once, when the raster is produced; the encoder only
/// reads the booleans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<bool>,
}

impl Raster {
    /// All-white raster.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::filled(width, height, false)
    }

    /// Raster with every pixel set to `black`.
    pub fn filled(width: u32, height: u32, black: bool) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            pixels: vec![black; width as usize * height as usize],
        })
    }

    /// Wrap an existing row-major pixel vector (`true` = black).
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<bool>) -> Result<Self> {
        if width == 0 || height == 0 || pixels.len() != width as usize * height as usize {
            return Err(Error::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Panics if `(x, y)` lies outside the raster.
    pub fn is_black(&self, x: u32, y: u32) -> bool {
        self.pixels[self.index(x, y)]
    }

    /// Panics if `(x, y)` lies outside the raster.
    pub fn set(&mut self, x: u32, y: u32, black: bool) {
        let i = self.index(x, y);
        self.pixels[i] = black;
    }

    fn index(&self, x: u32, y: u32) -> usize {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x}, {y}) out of bounds for {}x{} raster",
            self.width,
            self.height
        );
        y as usize * self.width as usize + x as usize
    }

    /// Number of black pixels.
    pub fn black_count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p).count()
    }
}

/// Row-major 1bpp bitmap, `ceil(width / 8)` bytes per row, 1 = black.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBitmap {
    bytes_per_row: usize,
    height: u32,
    data: Vec<u8>,
}

impl PackedBitmap {
    /// Packs a raster into the printer's 1bpp layout.
    ///
    /// - rows top to bottom
    /// - within each row, groups of 8 pixels become one byte
    /// - bit 0 is the leftmost pixel of the group (LSB first)
    /// - unused trailing bits of the last byte in a row stay zero
    pub fn encode(raster: &Raster) -> Self {
        let width = raster.width as usize;
        let bytes_per_row = width.div_ceil(8);
        let mut data = vec![0u8; bytes_per_row * raster.height as usize];
        for (row, pixels) in raster.pixels.chunks(width).enumerate() {
            let row_off = row * bytes_per_row;
            for (col, _) in pixels.iter().enumerate().filter(|(_, black)| **black) {
                data[row_off + col / 8] |= 1 << (col % 8);
            }
        }
        Self {
            bytes_per_row,
            height: raster.height,
            data,
        }
    }

    pub fn bytes_per_row(&self) -> usize {
        self.bytes_per_row
    }

    /// Row count.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
