use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use super::PipelineError;

/// Decode `image_data`, scale it to `width` x `height` and encode the result
/// as JPEG.
///
/// A zero side is derived from the source aspect ratio; both sides zero keep
/// the source dimensions.
pub fn resize_image(
    image_data: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, PipelineError> {
    // Load the image, whatever format the source uses
    let img = image::load_from_memory(image_data)
        .map_err(|e| PipelineError::DecodeError(format!("Failed to load image: {}", e)))?;

    let (current_width, current_height) = img.dimensions();
    if current_width == 0 || current_height == 0 {
        return Err(PipelineError::ResizeError("Source image is empty".to_string()));
    }

    let (target_width, target_height) =
        target_dimensions((current_width, current_height), (width, height));

    let resized = if (target_width, target_height) == (current_width, current_height) {
        img
    } else {
        img.resize_exact(target_width, target_height, FilterType::Lanczos3)
    };

    encode_jpeg(resized, quality)
}

fn target_dimensions(
    (current_width, current_height): (u32, u32),
    requested: (u32, u32),
) -> (u32, u32) {
    let scale = |side: u32, from: u32, to: u32| -> u32 {
        ((side as f64 * to as f64 / from as f64).round() as u32).max(1)
    };

    match requested {
        (0, 0) => (current_width, current_height),
        (width, 0) => (width, scale(current_height, current_width, width)),
        (0, height) => (scale(current_width, current_height, height), height),
        (width, height) => (width, height),
    }
}

fn encode_jpeg(img: DynamicImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let mut output = Vec::new();
    // JPEG has no alpha channel
    let rgb = img.to_rgb8();

    let mut encoder = JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .map_err(|e| PipelineError::EncodeError(format!("JPEG encoding failed: {}", e)))?;

    Ok(output)
}
