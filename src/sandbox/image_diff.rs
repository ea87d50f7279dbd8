//! Perceptual pixel comparison of two encoded images.

use image::{ImageError, Rgba};

/// Per-pixel colour distance above which two pixels count as different (0..1)
pub const DEFAULT_THRESHOLD: f64 = 0.1;

// Maximum possible YIQ delta between two colours
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Returns the share of matching pixels, in `[0, 1]`.
///
/// Images of different dimensions never match.
pub fn similarity(reference: &[u8], candidate: &[u8], threshold: f64) -> Result<f64, ImageError> {
    let expected = image::load_from_memory(reference)?.to_rgba8();
    let actual = image::load_from_memory(candidate)?.to_rgba8();

    if expected.dimensions() != actual.dimensions() {
        return Ok(0.0);
    }
    let total = u64::from(expected.width()) * u64::from(expected.height());
    if total == 0 {
        return Ok(1.0);
    }

    let max_delta = MAX_YIQ_DELTA * threshold * threshold;
    let different = expected
        .pixels()
        .zip(actual.pixels())
        .filter(|(a, b)| a != b && color_delta(a, b) > max_delta)
        .count() as u64;

    Ok(1.0 - different as f64 / total as f64)
}

fn blend(channel: u8, alpha: f64) -> f64 {
    255.0 + (f64::from(channel) - 255.0) * alpha
}

fn yiq(pixel: &Rgba<u8>) -> (f64, f64, f64) {
    let alpha = f64::from(pixel[3]) / 255.0;
    let (r, g, b) = (
        blend(pixel[0], alpha),
        blend(pixel[1], alpha),
        blend(pixel[2], alpha),
    );
    (
        r * 0.29889531 + g * 0.58662247 + b * 0.11448223,
        r * 0.59597799 - g * 0.27417610 - b * 0.32180189,
        r * 0.21147017 - g * 0.52261711 + b * 0.31114694,
    )
}

fn color_delta(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    let (y1, i1, q1) = yiq(a);
    let (y2, i2, q2) = yiq(b);
    let (y, i, q) = (y1 - y2, i1 - i2, q1 - q2);
    0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q
}
