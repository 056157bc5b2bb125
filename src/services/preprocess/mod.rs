// Hot-path image preprocessing: grayscale + binary threshold ahead of recognition
//
// The OCR engine performs noticeably better on binarized input, so every task
// runs through decode -> grayscale -> threshold -> PNG before recognition.

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use serde::Deserialize;
use std::io::Cursor;

use crate::core::errors::PreprocessError;

/// Thresholding strategy applied after the grayscale pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// Fixed cutoff from configuration.
    Binary,
    /// Cutoff derived per image with Otsu's method.
    Otsu,
}

/// Decodes `bytes`, binarizes the image, and re-encodes it as PNG.
///
/// `value` is only consulted in `Binary` mode; Otsu derives its own cutoff.
pub fn prepare_for_recognition(
    bytes: &[u8],
    value: u8,
    mode: ThresholdMode,
) -> Result<Vec<u8>, PreprocessError> {
    let img = image::load_from_memory(bytes).map_err(PreprocessError::Decode)?;
    let gray = to_grayscale(&img);
    let binary = threshold(&gray, value, mode);
    encode_png(&binary)
}

/// Rec. 601 luma conversion on 16-bit channels, scaled down to 8-bit output.
pub fn to_grayscale(img: &DynamicImage) -> GrayImage {
    let rgba = img.to_rgba16();
    let mut gray = GrayImage::new(rgba.width(), rgba.height());

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, _] = pixel.0;
        let luma = (0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b)) / 256.0;
        gray.put_pixel(x, y, Luma([luma as u8]));
    }

    gray
}

/// Applies binary thresholding to a grayscale image.
pub fn threshold(img: &GrayImage, value: u8, mode: ThresholdMode) -> GrayImage {
    let cutoff = match mode {
        ThresholdMode::Binary => value,
        ThresholdMode::Otsu => otsu_threshold(img),
    };

    let mut binary = GrayImage::new(img.width(), img.height());
    for (x, y, pixel) in img.enumerate_pixels() {
        let out = if pixel.0[0] > cutoff { 255 } else { 0 };
        binary.put_pixel(x, y, Luma([out]));
    }

    binary
}

/// Picks the cutoff maximizing inter-class variance over a 256-bin histogram.
/// Ties resolve to the lowest candidate.
fn otsu_threshold(img: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in img.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total = u64::from(img.width()) * u64::from(img.height());

    let sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut sum_b = 0.0;
    let mut weight_b = 0u64;
    let mut var_max = 0.0;
    let mut cutoff = 0u8;

    for i in 0..256 {
        weight_b += histogram[i];
        if weight_b == 0 {
            continue;
        }
        let weight_f = total - weight_b;
        if weight_f == 0 {
            break;
        }
        sum_b += i as f64 * histogram[i] as f64;
        let mean_b = sum_b / weight_b as f64;
        let mean_f = (sum - sum_b) / weight_f as f64;
        let var_between =
            weight_b as f64 * weight_f as f64 * (mean_b - mean_f) * (mean_b - mean_f);
        if var_between > var_max {
            var_max = var_between;
            cutoff = i as u8;
        }
    }

    cutoff
}

fn encode_png(img: &GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .map_err(PreprocessError::Encode)?;
    Ok(png_bytes)
}
