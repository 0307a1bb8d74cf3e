use axum::extract::Multipart;
use tracing::{debug, warn};

use super::error::ApiError;
use crate::engine::ImageRole;

/// One uploaded file: raw bytes plus the declared content-type and the form
/// field it arrived in.
pub struct Upload {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub role: ImageRole,
}

/// The two uploads a swap request must carry.
pub struct SwapUploads {
    pub source: Upload,
    pub dest: Upload,
}

const SOURCE_FIELD: &str = "source_image";
const DEST_FIELD: &str = "dest_image";

/// Pull the `source_image` and `dest_image` file fields out of a multipart
/// request. Unknown fields are ignored; a repeated field keeps the last
/// occurrence; a missing or empty field is a client error.
pub async fn extract_swap_uploads(multipart: &mut Multipart) -> Result<SwapUploads, ApiError> {
    let mut source: Option<Upload> = None;
    let mut dest: Option<Upload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidInput(format!("Failed to process multipart field: {e}")))?
    {
        let role = match field.name() {
            Some(SOURCE_FIELD) => ImageRole::Source,
            Some(DEST_FIELD) => ImageRole::Destination,
            other => {
                debug!("Ignoring multipart field: {}", other.unwrap_or("unnamed"));
                continue;
            }
        };

        let slot = match role {
            ImageRole::Source => &mut source,
            ImageRole::Destination => &mut dest,
        };
        if slot.is_some() {
            warn!("Multiple '{role}' image fields found, using the last one");
        }

        let content_type = field.content_type().map(str::to_string);
        debug!("Received {role} image with content type: {content_type:?}");

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::InvalidInput(format!("Failed to read file data: {e}")))?
            .to_vec();

        *slot = Some(Upload {
            data,
            content_type,
            role,
        });
    }

    let source = require(source, SOURCE_FIELD)?;
    let dest = require(dest, DEST_FIELD)?;
    Ok(SwapUploads { source, dest })
}

fn require(upload: Option<Upload>, field: &str) -> Result<Upload, ApiError> {
    let upload = upload.ok_or_else(|| {
        ApiError::InvalidInput(format!("Missing '{field}' field in multipart request."))
    })?;
    if upload.data.is_empty() {
        return Err(ApiError::InvalidInput(format!(
            "Uploaded '{field}' field is empty."
        )));
    }
    Ok(upload)
}
