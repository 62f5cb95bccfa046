//! Memoized loading of local image and font files
//!
//! Local assets are assumed not to change while the process runs, so decoded
//! images and parsed fonts are kept for the process lifetime.

mod font;
mod memo;

pub use font::FontFace;
pub use memo::Memo;

use ab_glyph::FontArc;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when loading a local asset
#[derive(Debug, Error)]
pub enum AssetError {
    /// The file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not a decodable image
    #[error("Failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The file is not a usable font
    #[error("Failed to parse font {path}: {source}")]
    Font {
        path: PathBuf,
        #[source]
        source: ab_glyph::InvalidFont,
    },

    /// Font sizes must be finite and positive
    #[error("Invalid font size: {0}")]
    InvalidFontSize(f32),
}

/// Shared cache of local images keyed by path and fonts keyed by path and size
#[derive(Debug, Default)]
pub struct AssetCache {
    images: Memo<PathBuf, DynamicImage>,
    fonts: Memo<(PathBuf, u32), FontFace>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and decodes the image at `path`, decoding each path only once
    pub fn load_image(&self, path: impl AsRef<Path>) -> Result<Arc<DynamicImage>, AssetError> {
        let path = path.as_ref().to_path_buf();
        self.images.get_or_try_insert_with(path.clone(), || {
            debug!(path = %path.display(), "decoding local image");
            let bytes = std::fs::read(&path).map_err(|source| AssetError::Io {
                path: path.clone(),
                source,
            })?;
            image::load_from_memory(&bytes).map_err(|source| AssetError::Image {
                path: path.clone(),
                source,
            })
        })
    }

    /// Loads the font at `path` bound to `size`, parsing each (path, size) only once
    pub fn load_font(&self, path: impl AsRef<Path>, size: f32) -> Result<Arc<FontFace>, AssetError> {
        if !size.is_finite() || size <= 0.0 {
            return Err(AssetError::InvalidFontSize(size));
        }

        let path = path.as_ref().to_path_buf();
        self.fonts
            .get_or_try_insert_with((path.clone(), size.to_bits()), || {
                debug!(path = %path.display(), size, "parsing local font");
                let bytes = std::fs::read(&path).map_err(|source| AssetError::Io {
                    path: path.clone(),
                    source,
                })?;
                let font = FontArc::try_from_vec(bytes).map_err(|source| AssetError::Font {
                    path: path.clone(),
                    source,
                })?;
                Ok(FontFace::new(font, size))
            })
    }

    /// Number of decoded images held
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Number of (font, size) faces held
    pub fn font_count(&self) -> usize {
        self.fonts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let path = dir.join(name);
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn test_load_image_decodes_once() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = write_png(temp_dir.path(), "a.png", 3, 2);
        let cache = AssetCache::new();

        let first = cache.load_image(&path).unwrap();
        let second = cache.load_image(&path).unwrap();

        assert_eq!((first.width(), first.height()), (3, 2));
        assert!(Arc::ptr_eq(&first, &second), "Second load should hit the memo");
        assert_eq!(cache.image_count(), 1);
    }

    #[test]
    fn test_load_image_missing_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let cache = AssetCache::new();

        let result = cache.load_image(temp_dir.path().join("missing.png"));

        assert!(matches!(result, Err(AssetError::Io { .. })));
        assert_eq!(cache.image_count(), 0);
    }

    #[test]
    fn test_load_image_rejects_non_image() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("notes.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        let result = AssetCache::new().load_image(&path);

        assert!(matches!(result, Err(AssetError::Image { .. })));
    }

    fn fixture_font() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/DejaVuSans.ttf")
    }

    #[test]
    fn test_load_font_memoizes_per_size() {
        let cache = AssetCache::new();

        let first = cache.load_font(fixture_font(), 24.0).unwrap();
        let again = cache.load_font(fixture_font(), 24.0).unwrap();
        let larger = cache.load_font(fixture_font(), 48.0).unwrap();

        assert!(Arc::ptr_eq(&first, &again), "Same size should hit the memo");
        assert!(!Arc::ptr_eq(&first, &larger));
        assert_eq!(first.size(), 24.0);
        assert_eq!(larger.size(), 48.0);
        assert_eq!(cache.font_count(), 2);
    }

    #[test]
    fn test_font_metrics_scale_with_size() {
        let cache = AssetCache::new();
        let small = cache.load_font(fixture_font(), 20.0).unwrap();
        let large = cache.load_font(fixture_font(), 40.0).unwrap();

        assert_eq!(small.measure(""), 0.0);
        assert!(small.measure("WW") > small.measure("ii"));

        let ratio = large.measure("Poster") / small.measure("Poster");
        assert!((ratio - 2.0).abs() < 0.02, "Width should double, got ratio {ratio}");

        // Line height covers ascent plus descent, a bit more than one em
        let line = large.line_height();
        assert!(line > 40.0 && line < 60.0, "Unexpected line height {line}");
        assert!((large.scale().y - line).abs() < 0.01);
    }

    #[test]
    fn test_load_font_rejects_invalid_data() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("broken.ttf");
        std::fs::write(&path, b"not a font").unwrap();
        let cache = AssetCache::new();

        let result = cache.load_font(&path, 24.0);

        assert!(matches!(result, Err(AssetError::Font { .. })));
        assert_eq!(cache.font_count(), 0);
    }

    #[test]
    fn test_load_font_rejects_bad_size() {
        let cache = AssetCache::new();

        assert!(matches!(
            cache.load_font("whatever.ttf", 0.0),
            Err(AssetError::InvalidFontSize(_))
        ));
        assert!(matches!(
            cache.load_font("whatever.ttf", f32::NAN),
            Err(AssetError::InvalidFontSize(_))
        ));
    }
}
