//! Raster canvas for compositing images, rules, and anchored text
//!
//! The canvas is an RGBA buffer initialized from a background image. Sources
//! are drawn with alpha blending, text is rasterized glyph by glyph, and the
//! result is encoded as PNG.

pub mod transform;

use ab_glyph::{point, Font, GlyphId, ScaleFont};
use image::{imageops, DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::assets::{AssetCache, AssetError, FontFace};
use crate::remote::{FetchError, RemoteFetcher};

/// Errors that can occur while drawing or encoding
#[derive(Debug, Error)]
pub enum CanvasError {
    /// A font or background asset failed to load
    #[error(transparent)]
    Asset(#[from] AssetError),

    /// A remote background failed to load
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// PNG encoding failed
    #[error("Failed to encode PNG: {0}")]
    Encode(#[from] image::ImageError),
}

/// How to draw one run of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextConfig {
    /// The text to draw, on a single line
    pub text: String,
    /// Path to a TrueType or OpenType font
    pub font: PathBuf,
    /// Em size in pixels
    pub size: f32,
    /// RGBA fill color
    #[serde(default = "default_text_color")]
    pub color: [u8; 4],
    /// Anchor x position
    pub x: f32,
    /// Anchor y position (baseline when `align_y` is 0)
    pub y: f32,
    /// Fraction of the text width to shift left (0 = left, 0.5 = center, 1 = right)
    #[serde(default)]
    pub align_x: f32,
    /// Fraction of the line height to shift down
    #[serde(default)]
    pub align_y: f32,
    /// Shrinks the font so the text fits this width; 0 disables
    #[serde(default)]
    pub max_width: f32,
}

fn default_text_color() -> [u8; 4] {
    [0, 0, 0, 255]
}

/// An RGBA drawing surface
#[derive(Debug, Clone)]
pub struct Canvas {
    image: RgbaImage,
}

impl Canvas {
    /// Creates a canvas the size of `background`, with the background drawn at the origin
    pub fn new(background: &DynamicImage) -> Self {
        Self {
            image: background.to_rgba8(),
        }
    }

    /// Creates a canvas from a memoized local background
    pub fn from_local(assets: &AssetCache, path: impl AsRef<Path>) -> Result<Self, CanvasError> {
        let background = assets.load_image(path)?;
        Ok(Self::new(&background))
    }

    /// Creates a canvas from a remote background fetched through the store
    pub async fn from_remote(
        fetcher: &RemoteFetcher,
        url: &str,
        width: u32,
        height: u32,
        ttl: Duration,
    ) -> Result<Self, CanvasError> {
        let background = fetcher.fetch(url, width, height, ttl).await?;
        Ok(Self::new(&background))
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// The composited pixels so far
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Alpha-blends `img` with its top-left corner at (`x`, `y`)
    pub fn draw_image(&mut self, img: &DynamicImage, x: i64, y: i64) {
        imageops::overlay(&mut self.image, &img.to_rgba8(), x, y);
    }

    /// Strokes a 1px horizontal line of `length` pixels starting at (`x`, `y`)
    pub fn draw_line(&mut self, color: [u8; 4], x: f32, y: f32, length: f32) {
        let row = y.floor() as i64;
        let start = x.round() as i64;
        let end = (x + length).round() as i64;
        for col in start..end {
            blend_pixel(&mut self.image, col, row, Rgba(color), 1.0);
        }
    }

    /// Width `text` would occupy with the configured font and size
    pub fn measure_text(&self, assets: &AssetCache, text: &TextConfig) -> Result<f32, CanvasError> {
        let face = assets.load_font(&text.font, text.size)?;
        Ok(face.measure(&text.text))
    }

    /// Draws `text` anchored at its configured position
    ///
    /// When `max_width` is set and the text is wider, the font size is scaled
    /// down so the text fits.
    pub fn draw_text(&mut self, assets: &AssetCache, text: &TextConfig) -> Result<(), CanvasError> {
        let mut face = assets.load_font(&text.font, text.size)?;
        let mut width = face.measure(&text.text);
        if text.max_width > 0.0 && width > text.max_width {
            face = assets.load_font(&text.font, text.size * text.max_width / width)?;
            width = face.measure(&text.text);
        }

        let x = text.x - text.align_x * width;
        let y = text.y + text.align_y * face.line_height();
        self.draw_glyphs(&face, &text.text, x, y, Rgba(text.color));
        Ok(())
    }

    /// Rasterizes `text` with its baseline starting at (`x`, `y`)
    fn draw_glyphs(&mut self, face: &FontFace, text: &str, x: f32, y: f32, color: Rgba<u8>) {
        let scaled = face.font().as_scaled(face.scale());
        let mut caret = x;
        let mut previous: Option<GlyphId> = None;

        for c in text.chars() {
            let id = scaled.glyph_id(c);
            if let Some(prev) = previous {
                caret += scaled.kern(prev, id);
            }
            let glyph = id.with_scale_and_position(scaled.scale(), point(caret, y));
            caret += scaled.h_advance(id);
            previous = Some(id);

            let Some(outlined) = face.font().outline_glyph(glyph) else {
                continue;
            };
            let bounds = outlined.px_bounds();
            let image = &mut self.image;
            outlined.draw(|gx, gy, coverage| {
                blend_pixel(
                    image,
                    bounds.min.x as i64 + gx as i64,
                    bounds.min.y as i64 + gy as i64,
                    color,
                    coverage,
                );
            });
        }
    }

    /// Encodes the canvas as PNG
    pub fn encode_png(&self) -> Result<Vec<u8>, CanvasError> {
        let mut buf = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }

    /// Consumes the canvas, returning its pixels
    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

/// Source-over blend of `color` at `coverage` onto one pixel; out-of-bounds is ignored
fn blend_pixel(image: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>, coverage: f32) {
    if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
        return;
    }
    let src_a = color[3] as f32 / 255.0 * coverage.clamp(0.0, 1.0);
    if src_a <= 0.0 {
        return;
    }

    let dst = image.get_pixel_mut(x as u32, y as u32);
    let dst_a = dst[3] as f32 / 255.0;
    let out_a = src_a + dst_a * (1.0 - src_a);
    for i in 0..3 {
        let blended =
            (color[i] as f32 * src_a + dst[i] as f32 * dst_a * (1.0 - src_a)) / out_a;
        dst[i] = blended.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}
