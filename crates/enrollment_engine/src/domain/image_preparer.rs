use base64::{engine::general_purpose, Engine as _};
use enroll_common::domain::{DomainError, DomainResult};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::debug;

/// Longest side, in pixels, of an image sent to a device
pub const MAX_IMAGE_SIDE: u32 = 480;

/// JPEG quality used for the device record
pub const JPEG_QUALITY: u8 = 85;

/// Photo normalised for the device: bounded, RGB, JPEG-encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub jpeg: Vec<u8>,
    /// Standard base64 of `jpeg` with no data-URL prefix
    pub record: String,
    pub width: u32,
    pub height: u32,
}

/// Decode an encoded photo (JPEG, PNG, BMP, WebP) and prepare it
pub fn prepare_image_bytes(bytes: &[u8]) -> DomainResult<PreparedImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| DomainError::ImageDecodeError(e.to_string()))?;
    prepare_image(&image)
}

/// Prepare a photo given as a `data:image/...;base64,` URL
pub fn prepare_data_url(data_url: &str) -> DomainResult<PreparedImage> {
    let (header, body) = data_url
        .split_once(',')
        .ok_or_else(|| DomainError::ImageDecodeError("data URL has no payload".to_string()))?;
    if !header.starts_with("data:") || !header.ends_with(";base64") {
        return Err(DomainError::ImageDecodeError(format!(
            "unsupported data URL header '{}'",
            header
        )));
    }

    let bytes = general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| DomainError::ImageDecodeError(e.to_string()))?;
    prepare_image_bytes(&bytes)
}

/// Downscale so neither side exceeds [`MAX_IMAGE_SIDE`], drop alpha, encode JPEG.
///
/// Images already within bounds keep their size; nothing is ever upscaled.
pub fn prepare_image(image: &DynamicImage) -> DomainResult<PreparedImage> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(DomainError::ImageDecodeError(
            "image has no pixels".to_string(),
        ));
    }

    let (out_width, out_height) = bounded_dimensions(width, height, MAX_IMAGE_SIDE);
    let rgb = if (out_width, out_height) == (width, height) {
        image.to_rgb8()
    } else {
        image
            .resize_exact(out_width, out_height, FilterType::Triangle)
            .to_rgb8()
    };

    let mut jpeg = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
        encoder
            .encode_image(&rgb)
            .map_err(|e| DomainError::EncodingError(e.to_string()))?;
    }

    debug!(
        source_width = width,
        source_height = height,
        width = out_width,
        height = out_height,
        jpeg_bytes = jpeg.len(),
        "prepared enrollment image"
    );

    let record = general_purpose::STANDARD.encode(&jpeg);
    Ok(PreparedImage {
        jpeg,
        record,
        width: out_width,
        height: out_height,
    })
}

/// Scale factor min(1, max_side / longest side), each side rounded half-up
fn bounded_dimensions(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side {
        return (width, height);
    }
    let scale = f64::from(max_side) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}
