//! Image normalization: decode any supported mode to 8-bit RGB and bound the resolution.
//!
//! Every image that reaches the extractor passes through here, so the detector
//! only ever sees a dense row-major `H × W × 3` `u8` buffer ([`RgbImage`]).

use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageReader, RgbImage};
use std::path::Path;
use thiserror::Error;

/// Longest side allowed for roster loading and group photos.
pub const DEFAULT_MAX_DIMENSION: u32 = 1600;
/// Longest side allowed for enrollment photos.
pub const ENROLL_MAX_DIMENSION: u32 = 1200;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("cannot decode image: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode in-memory image bytes into a bounded RGB image. Never touches disk.
pub fn normalize_bytes(bytes: &[u8], max_dimension: u32) -> Result<RgbImage, NormalizeError> {
    let decoded = image::load_from_memory(bytes)?;
    Ok(bound(decoded.into_rgb8(), max_dimension))
}

/// Decode an image file into a bounded RGB image.
///
/// With `rewrite` set, a source that was not already 8-bit RGB is replaced on
/// disk by its full-resolution RGB conversion so later loads skip the
/// conversion. A failed rewrite is logged and does not fail normalization.
pub fn normalize_file(
    path: &Path,
    max_dimension: u32,
    rewrite: bool,
) -> Result<RgbImage, NormalizeError> {
    let decoded = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let original = decoded.color();
    let rgb = into_rgb(decoded);

    if rewrite && original != ColorType::Rgb8 {
        match rgb.save(path) {
            Ok(()) => tracing::info!(
                path = %path.display(),
                from = ?original,
                "converted roster image to RGB"
            ),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to write RGB conversion back"
            ),
        }
    }

    Ok(bound(rgb, max_dimension))
}

fn into_rgb(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.into_rgb8(),
    }
}

/// Downscale with Lanczos3 so the longest side is at most `max_dimension`.
fn bound(image: RgbImage, max_dimension: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (new_w, new_h) = bounded_size(width, height, max_dimension);
    if (new_w, new_h) == (width, height) {
        return image;
    }
    tracing::debug!(width, height, new_w, new_h, "downscaling image");
    image::imageops::resize(&image, new_w, new_h, FilterType::Lanczos3)
}

/// Target size preserving aspect ratio. Never upscales; each side stays at least 1px.
fn bounded_size(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || max_dimension == 0 {
        return (width, height);
    }
    let scale = max_dimension as f64 / longest as f64;
    let w = ((width as f64 * scale) as u32).clamp(1, max_dimension);
    let h = ((height as f64 * scale) as u32).clamp(1, max_dimension);
    (w, h)
}
