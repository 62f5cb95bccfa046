//! Whole-image transforms applied to sources before compositing

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

/// Resizes `input` to `width` x `height` with a Lanczos3 filter
///
/// Returns the input untouched when it already has the requested size. A zero
/// width or height is derived from the other one, preserving the aspect ratio;
/// both zero leaves the image as is.
pub fn resize(input: DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (src_w, src_h) = input.dimensions();
    let (width, height) = match (width, height) {
        (0, 0) => return input,
        (0, h) => (scaled_side(src_w, h, src_h), h),
        (w, 0) => (w, scaled_side(src_h, w, src_w)),
        (w, h) => (w, h),
    };

    if (src_w, src_h) == (width, height) {
        return input;
    }
    input.resize_exact(width, height, FilterType::Lanczos3)
}

/// `side * target / reference`, rounded and never below one pixel
fn scaled_side(side: u32, target: u32, reference: u32) -> u32 {
    if reference == 0 {
        return target;
    }
    let scaled = (side as f64 * target as f64 / reference as f64).round() as u32;
    scaled.max(1)
}

/// Crops `input` into a circle
///
/// The output is square with a side of the mean of the input's width and
/// height; pixels outside the inscribed circle become fully transparent.
pub fn round(input: &DynamicImage) -> DynamicImage {
    let (w, h) = input.dimensions();
    let size = (w + h) / 2;
    let mut out = RgbaImage::new(size, size);
    imageops::replace(&mut out, &input.to_rgba8(), 0, 0);

    let radius = size as f32 / 2.0;
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - radius;
        let dy = y as f32 + 0.5 - radius;
        if dx * dx + dy * dy > radius * radius {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    DynamicImage::ImageRgba8(out)
}
