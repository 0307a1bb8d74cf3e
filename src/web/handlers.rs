// API handlers for the web server

use super::{
    error::ApiError,
    extract::extract_swap_uploads,
    image_codec::{decode_upload, encode_png},
};
use crate::engine::EngineHandle;
use axum::{
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
};
use tracing::{debug, info};
use uuid::Uuid;

// --- POST /swapper ---
// Swaps the first face of the uploaded source image onto the first face of
// the uploaded destination image and returns the composite as PNG.
pub async fn swap_faces(
    State(engine): State<EngineHandle>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();

    let uploads = extract_swap_uploads(&mut multipart).await?;
    info!(
        "Swap request: request_id={}, source={} bytes, dest={} bytes",
        request_id,
        uploads.source.data.len(),
        uploads.dest.data.len()
    );

    // Decode both uploads off the async runtime; source first.
    let (source_image, dest_image) = tokio::task::spawn_blocking(move || {
        let source = decode_upload(&uploads.source)?;
        let dest = decode_upload(&uploads.dest)?;
        Ok::<_, ApiError>((source, dest))
    })
    .await
    .map_err(|e| ApiError::InternalError(format!("Image decode task failed: {e}")))??;

    debug!(
        "Images decoded: source {}x{}, dest {}x{}",
        source_image.width(),
        source_image.height(),
        dest_image.width(),
        dest_image.height()
    );

    let result = engine.swap(source_image, dest_image).await?;

    let png = tokio::task::spawn_blocking(move || encode_png(&result))
        .await
        .map_err(|e| ApiError::InternalError(format!("Image encode task failed: {e}")))??;

    debug!(
        "Swap completed: request_id={}, {} bytes of PNG",
        request_id,
        png.len()
    );

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}
