use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use tracing::debug;

use super::error::ApiError;
use super::extract::Upload;

/// Validate an upload's declared content-type and decode it to RGB pixels.
///
/// Only `image/jpeg` and `image/png` are accepted; anything else (including a
/// missing content-type) is rejected before the bytes are looked at. The
/// declared type is used as the decode format: a PNG-labelled body that is
/// not a PNG is a decode error, not an auto-detection candidate.
pub fn decode_upload(upload: &Upload) -> Result<RgbImage, ApiError> {
    let declared = upload.content_type.as_deref().unwrap_or("");
    let essence = declared
        .parse::<mime::Mime>()
        .ok()
        .map(|m| m.essence_str().to_string());

    let format = match essence.as_deref() {
        Some("image/jpeg") => ImageFormat::Jpeg,
        Some("image/png") => ImageFormat::Png,
        _ => {
            let shown = if declared.is_empty() { "unknown" } else { declared };
            return Err(ApiError::InvalidInput(format!(
                "Invalid file type: {shown}. Only JPEG and PNG are supported."
            )));
        }
    };

    let decoded = image::load_from_memory_with_format(&upload.data, format)
        .map_err(|e| {
            debug!("Failed to decode {} image as {:?}: {}", upload.role, format, e);
            ApiError::DecodeError(format!("Failed to decode {} image", upload.role))
        })?
        .to_rgb8();

    Ok(decoded)
}

/// Encode the result image as PNG bytes.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ApiError> {
    let mut buffer = Cursor::new(Vec::new());
    image::write_buffer_with_format(
        &mut buffer,
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
        ImageFormat::Png,
    )
    .map_err(|e| {
        debug!("PNG encoding failed: {}", e);
        ApiError::EncodeError("Failed to encode resulting image".to_string())
    })?;

    Ok(buffer.into_inner())
}
