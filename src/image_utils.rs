//! Image normalization before OCR.
//!
//! Pages arrive here as PNG buffers straight from rasterization. We undo
//! scan rotation, trim uniform borders, and split extremely tall images so
//! every buffer handed to a vision model is a reasonable tile.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat, imageops::FilterType};

use crate::{prelude::*, tesseract::TesseractPool};

/// Height:width ratio above which a page is split into vertical slices.
/// Receipt-style scans routinely exceed this and overwhelm vision-model
/// tiling if sent whole.
const ASPECT_SPLIT_RATIO: f32 = 5.0;

/// Per-channel tolerance when deciding whether a border pixel matches the
/// background.
const TRIM_TOLERANCE: i16 = 12;

/// Options for [`cleanup_image`].
#[derive(Clone, Copy, Debug)]
pub struct CleanupOptions {
    pub correct_orientation: bool,
    pub trim_edges: bool,
}

/// Normalize one page image, returning one buffer in the normal case and
/// several when the page had to be split for aspect ratio.
#[instrument(level = "debug", skip_all)]
pub async fn cleanup_image(
    pool: Option<&TesseractPool>,
    buffer: &[u8],
    options: CleanupOptions,
) -> Result<Vec<Vec<u8>>> {
    let mut image = image::load_from_memory(buffer)
        .context("failed to decode page image")?;

    if options.correct_orientation {
        if let Some(pool) = pool {
            match pool.detect_rotation(buffer).await {
                Ok(Some(degrees)) => {
                    debug!(degrees, "correcting page rotation");
                    image = apply_rotation(image, degrees);
                }
                Ok(None) => {}
                // A failed orientation probe should not sink the page.
                Err(err) => warn!("orientation detection failed: {err:?}"),
            }
        }
    }

    if options.trim_edges {
        image = trim_uniform_border(image);
    }

    split_tall_image(image)
        .into_iter()
        .map(|slice| encode_png(&slice))
        .collect()
}

/// Apply Tesseract's reported clockwise correction angle.
fn apply_rotation(image: DynamicImage, degrees: u32) -> DynamicImage {
    match degrees {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image,
    }
}

/// Crop away border rows and columns that match the corner pixel within
/// tolerance. Returns the image unchanged when it is entirely uniform.
fn trim_uniform_border(image: DynamicImage) -> DynamicImage {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width < 3 || height < 3 {
        return image;
    }
    let background = rgba.get_pixel(0, 0).0;
    let matches_background = |x: u32, y: u32| {
        let pixel = rgba.get_pixel(x, y).0;
        pixel
            .iter()
            .zip(background.iter())
            .all(|(a, b)| (*a as i16 - *b as i16).abs() <= TRIM_TOLERANCE)
    };

    let mut top = 0;
    while top < height && (0..width).all(|x| matches_background(x, top)) {
        top += 1;
    }
    if top == height {
        return image;
    }
    let mut bottom = height;
    while bottom > top && (0..width).all(|x| matches_background(x, bottom - 1)) {
        bottom -= 1;
    }
    let mut left = 0;
    while left < width && (top..bottom).all(|y| matches_background(left, y)) {
        left += 1;
    }
    let mut right = width;
    while right > left && (top..bottom).all(|y| matches_background(right - 1, y)) {
        right -= 1;
    }

    image.crop_imm(left, top, right - left, bottom - top)
}

/// Split an image into vertical slices when its height:width ratio exceeds
/// [`ASPECT_SPLIT_RATIO`]. Slices do not overlap.
fn split_tall_image(image: DynamicImage) -> Vec<DynamicImage> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return vec![image];
    }
    let ratio = height as f32 / width as f32;
    if ratio <= ASPECT_SPLIT_RATIO {
        return vec![image];
    }
    let slice_height = (width as f32 * ASPECT_SPLIT_RATIO) as u32;
    let slice_count = height.div_ceil(slice_height);
    (0..slice_count)
        .map(|i| {
            let y = i * slice_height;
            image.crop_imm(0, y, width, slice_height.min(height - y))
        })
        .collect()
}

/// Encode an image as PNG.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(buffer.into_inner())
}

/// Re-encode an image so its PNG form fits inside `max_bytes`, downscaling
/// iteratively. Returns `None` when the input already fits.
pub fn compress_to_bound(buffer: &[u8], max_bytes: u64) -> Result<Option<Vec<u8>>> {
    if max_bytes == 0 || (buffer.len() as u64) <= max_bytes {
        return Ok(None);
    }
    let mut image = image::load_from_memory(buffer)
        .context("failed to decode page image for compression")?;
    let mut encoded = buffer.to_vec();
    while encoded.len() as u64 > max_bytes {
        let (width, height) = image.dimensions();
        if width <= 256 || height <= 256 {
            break;
        }
        let scale = ((max_bytes as f64 / encoded.len() as f64).sqrt()).clamp(0.5, 0.9);
        image = image.resize(
            ((width as f64 * scale) as u32).max(1),
            ((height as f64 * scale) as u32).max(1),
            FilterType::Lanczos3,
        );
        encoded = encode_png(&image)?;
    }
    Ok(Some(encoded))
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::*;

    /// A white canvas with a dark rectangle at the given position.
    fn test_image(width: u32, height: u32, rect: (u32, u32, u32, u32)) -> DynamicImage {
        let mut img = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        let (x0, y0, x1, y1) = rect;
        for y in y0..y1 {
            for x in x0..x1 {
                img.put_pixel(x, y, Rgba([20, 20, 20, 255]));
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn trims_uniform_borders() {
        let img = test_image(100, 80, (20, 10, 60, 50));
        let trimmed = trim_uniform_border(img);
        assert_eq!(trimmed.dimensions(), (40, 40));
    }

    #[test]
    fn trim_keeps_fully_uniform_images() {
        let img = test_image(50, 50, (0, 0, 0, 0));
        let trimmed = trim_uniform_border(img);
        assert_eq!(trimmed.dimensions(), (50, 50));
    }

    #[test]
    fn splits_only_very_tall_images() {
        let tall = test_image(100, 1200, (10, 10, 20, 20));
        let slices = split_tall_image(tall);
        assert_eq!(slices.len(), 3);
        assert!(slices.iter().all(|s| s.dimensions().0 == 100));
        let total_height: u32 = slices.iter().map(|s| s.dimensions().1).sum();
        assert_eq!(total_height, 1200);

        let normal = test_image(100, 400, (10, 10, 20, 20));
        assert_eq!(split_tall_image(normal).len(), 1);
    }

    #[test]
    fn rotation_is_applied_clockwise() {
        let img = test_image(40, 20, (0, 0, 5, 5));
        assert_eq!(apply_rotation(img.clone(), 90).dimensions(), (20, 40));
        assert_eq!(apply_rotation(img.clone(), 180).dimensions(), (40, 20));
        assert_eq!(apply_rotation(img, 270).dimensions(), (20, 40));
    }

    #[test]
    fn compression_respects_the_bound() {
        // Noise compresses poorly, so this PNG is comfortably large.
        let mut img = RgbaImage::new(600, 600);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = ((x * 31 + y * 17) % 251) as u8;
            *pixel = Rgba([v, v.wrapping_mul(3), v.wrapping_add(91), 255]);
        }
        let encoded = encode_png(&DynamicImage::ImageRgba8(img)).unwrap();
        let bound = (encoded.len() / 2) as u64;
        let compressed = compress_to_bound(&encoded, bound).unwrap().unwrap();
        assert!(compressed.len() as u64 <= bound);
    }

    #[test]
    fn compression_is_skipped_when_already_small() {
        let img = test_image(50, 50, (0, 0, 10, 10));
        let encoded = encode_png(&img).unwrap();
        assert!(compress_to_bound(&encoded, 10_000_000).unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_without_pool_round_trips() {
        let img = test_image(100, 80, (20, 10, 60, 50));
        let encoded = encode_png(&img).unwrap();
        let buffers = cleanup_image(
            None,
            &encoded,
            CleanupOptions {
                correct_orientation: true,
                trim_edges: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(buffers.len(), 1);
        assert!(image::load_from_memory(&buffers[0]).is_ok());
    }
}
