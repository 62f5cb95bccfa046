//! Font faces at a fixed size

use ab_glyph::{Font, FontArc, GlyphId, PxScale, ScaleFont};
use std::fmt;

/// A parsed font bound to one size
///
/// `size` is the em size in pixels, matching point sizes at 72 DPI.
#[derive(Clone)]
pub struct FontFace {
    font: FontArc,
    size: f32,
}

impl fmt::Debug for FontFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FontFace")
            .field("glyphs", &self.font.glyph_count())
            .field("size", &self.size)
            .finish()
    }
}

impl FontFace {
    /// Binds `font` to `size`
    pub fn new(font: FontArc, size: f32) -> Self {
        Self { font, size }
    }

    /// The underlying parsed font
    pub fn font(&self) -> &FontArc {
        &self.font
    }

    /// Em size in pixels
    pub fn size(&self) -> f32 {
        self.size
    }

    /// Pixel scale that makes one em span `size` pixels
    pub fn scale(&self) -> PxScale {
        match self.font.units_per_em() {
            Some(units_per_em) if units_per_em > 0.0 => {
                PxScale::from(self.size * self.font.height_unscaled() / units_per_em)
            }
            _ => PxScale::from(self.size),
        }
    }

    /// Distance from the top of the tallest glyph to the lowest descender
    pub fn line_height(&self) -> f32 {
        self.font.as_scaled(self.scale()).height()
    }

    /// Advance width of `text` on a single line, kerning included
    pub fn measure(&self, text: &str) -> f32 {
        let scaled = self.font.as_scaled(self.scale());
        let mut width = 0.0;
        let mut previous: Option<GlyphId> = None;
        for c in text.chars() {
            let id = scaled.glyph_id(c);
            if let Some(prev) = previous {
                width += scaled.kern(prev, id);
            }
            width += scaled.h_advance(id);
            previous = Some(id);
        }
        width
    }
}
