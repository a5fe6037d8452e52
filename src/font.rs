//! Text rasterization for the printer.
//!
//! Glyph drawing sits behind the [`Typeface`] trait; [`TtfTypeface`] is the
//! rusttype-backed implementation. Layout follows the printer app this driver
//! replaces: a 20 px margin on every side, single line, baseline 20 px above
//! the bottom edge.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use rusttype::{point, Font, Scale};
use tracing::debug;

use crate::bitmap::Raster;
use crate::error::{Error, Result};

/// Space kept around the text, in pixels
const MARGIN: u32 = 20;

/// Red-channel values below this count as black
const BLACK_THRESHOLD: u8 = 128;

/// Horizontal placement of the line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
}

impl std::str::FromStr for Alignment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Alignment::Left),
            "center" => Ok(Alignment::Center),
            "right" => Ok(Alignment::Right),
            other => Err(Error::Font(format!("unknown alignment: {}", other))),
        }
    }
}

/// How a line of text should look on paper.
#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    /// Family looked up in the [`FontBook`]; unknown names use the default
    pub family: String,
    /// Pixel height of the font
    pub size: f32,
    pub alignment: Alignment,
    /// Rotate the finished canvas by 180 degrees
    pub upside_down: bool,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            family: String::new(),
            size: 48.0,
            alignment: Alignment::Left,
            upside_down: false,
        }
    }
}

/// Ink extent of a string relative to its pen origin on the baseline.
///
/// `top` is negative for glyphs rising above the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextBounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl TextBounds {
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
}

/// Glyph measurement and drawing.
pub trait Typeface: Send + Sync {
    /// Ink bounds of `text` drawn at the origin.
    fn bounds(&self, text: &str, size: f32) -> TextBounds;

    /// Horizontal pen advance of `text`.
    fn advance(&self, text: &str, size: f32) -> f32;

    /// Draw `text` in black with the pen starting at (`x`, `baseline`).
    fn draw(&self, canvas: &mut RgbImage, text: &str, x: f32, baseline: f32, size: f32);
}

/// TrueType face rendered with rusttype.
pub struct TtfTypeface {
    font: Font<'static>,
}

impl TtfTypeface {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let font = Font::try_from_vec(data).ok_or_else(|| Error::Font("invalid TTF data".into()))?;
        Ok(Self { font })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Font(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(data)
    }
}

impl Typeface for TtfTypeface {
    fn bounds(&self, text: &str, size: f32) -> TextBounds {
        let mut bounds: Option<TextBounds> = None;
        for glyph in self.font.layout(text, Scale::uniform(size), point(0.0, 0.0)) {
            if let Some(bb) = glyph.pixel_bounding_box() {
                let b = bounds.get_or_insert(TextBounds {
                    left: bb.min.x,
                    top: bb.min.y,
                    right: bb.max.x,
                    bottom: bb.max.y,
                });
                b.left = b.left.min(bb.min.x);
                b.top = b.top.min(bb.min.y);
                b.right = b.right.max(bb.max.x);
                b.bottom = b.bottom.max(bb.max.y);
            }
        }
        bounds.unwrap_or_default()
    }

    fn advance(&self, text: &str, size: f32) -> f32 {
        let scale = Scale::uniform(size);
        self.font
            .layout(text, scale, point(0.0, 0.0))
            .last()
            .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
            .unwrap_or(0.0)
    }

    fn draw(&self, canvas: &mut RgbImage, text: &str, x: f32, baseline: f32, size: f32) {
        let (width, height) = canvas.dimensions();
        for glyph in self.font.layout(text, Scale::uniform(size), point(x, baseline)) {
            if let Some(bb) = glyph.pixel_bounding_box() {
                glyph.draw(|gx, gy, v| {
                    let px = bb.min.x + gx as i32;
                    let py = bb.min.y + gy as i32;
                    if px < 0 || py < 0 || px as u32 >= width || py as u32 >= height {
                        return;
                    }
                    // Anti-aliased black ink over whatever is already there
                    let shade = (255.0 * (1.0 - v.clamp(0.0, 1.0))) as u8;
                    let pixel = canvas.get_pixel_mut(px as u32, py as u32);
                    if shade < pixel[0] {
                        *pixel = Rgb([shade, shade, shade]);
                    }
                });
            }
        }
    }
}

/// Typefaces by family name, with a fallback.
#[derive(Default, Clone)]
pub struct FontBook {
    faces: HashMap<String, Arc<dyn Typeface>>,
    default: Option<String>,
}

impl FontBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typeface. The first family registered becomes the default.
    pub fn insert(&mut self, family: impl Into<String>, face: Arc<dyn Typeface>) {
        let family = family.into();
        if self.default.is_none() {
            self.default = Some(family.clone());
        }
        self.faces.insert(family, face);
    }

    /// Load a TTF file under `family`.
    pub fn load_ttf<P: AsRef<Path>>(&mut self, family: impl Into<String>, path: P) -> Result<()> {
        let face = TtfTypeface::from_file(path)?;
        self.insert(family, Arc::new(face));
        Ok(())
    }

    pub fn set_default(&mut self, family: &str) -> Result<()> {
        if !self.faces.contains_key(family) {
            return Err(Error::Font(format!("unknown family: {}", family)));
        }
        self.default = Some(family.to_string());
        Ok(())
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.faces.keys().map(String::as_str)
    }

    /// Look up `family`, falling back to the default typeface.
    pub fn resolve(&self, family: &str) -> Result<Arc<dyn Typeface>> {
        if let Some(face) = self.faces.get(family) {
            return Ok(face.clone());
        }
        let fallback = self
            .default
            .as_ref()
            .and_then(|name| self.faces.get(name))
            .ok_or_else(|| Error::Font("no typeface registered".into()))?;
        debug!(family, "unknown font family, using default");
        Ok(fallback.clone())
    }
}

/// Renders one line of text into a black/white raster.
///
/// - width is `max(min_width, text width + 40)`; text wider than the printer
///   yields a wider raster, it is never clipped here
/// - height is the text height + 40
/// - line breaks are drawn as spaces
pub fn rasterize_text(
    text: &str,
    style: &TextStyle,
    face: &dyn Typeface,
    min_width: u32,
) -> Result<Raster> {
    if !(style.size > 0.0) {
        return Err(Error::Font(format!("invalid font size: {}", style.size)));
    }
    let line: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();

    let bounds = face.bounds(&line, style.size);
    let width = min_width.max(bounds.width() + 2 * MARGIN);
    let height = bounds.height() + 2 * MARGIN;

    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let anchor = match style.alignment {
        Alignment::Left => MARGIN as f32,
        Alignment::Center => width as f32 / 2.0,
        Alignment::Right => (width - MARGIN) as f32,
    };
    let advance = face.advance(&line, style.size);
    let pen_x = match style.alignment {
        Alignment::Left => anchor,
        Alignment::Center => anchor - advance / 2.0,
        Alignment::Right => anchor - advance,
    };
    face.draw(&mut canvas, &line, pen_x, (height - MARGIN) as f32, style.size);

    if style.upside_down {
        image::imageops::rotate180_in_place(&mut canvas);
    }

    debug!(width, height, chars = line.chars().count(), "rasterized text");
    threshold(&canvas)
}

fn threshold(canvas: &RgbImage) -> Result<Raster> {
    let pixels = canvas.pixels().map(|p| p[0] < BLACK_THRESHOLD).collect();
    Raster::from_pixels(canvas.width(), canvas.height(), pixels)
}
