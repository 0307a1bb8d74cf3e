// Error types for the API server

use super::models::ErrorBody;
use crate::engine::EngineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// API server error types. Each variant maps to one HTTP status; the
/// response body is always the [`ErrorBody`] envelope.
#[derive(Debug)]
pub enum ApiError {
    /// Unsupported upload content-type, or a malformed/incomplete request.
    InvalidInput(String),
    /// Upload bytes do not form a valid image.
    DecodeError(String),
    /// The detector returned zero faces for one of the images.
    NoFaceDetected(String),
    /// The result image could not be serialized.
    EncodeError(String),
    /// Any other failure. The message is kept generic; detail goes into
    /// `error_details`.
    InternalError(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::DecodeError(_) | Self::NoFaceDetected(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::EncodeError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, error_details) = match self {
            Self::InvalidInput(msg)
            | Self::DecodeError(msg)
            | Self::NoFaceDetected(msg)
            | Self::EncodeError(msg) => (msg, None),
            Self::InternalError(details) => ("Internal server error".to_string(), Some(details)),
        };

        let body = Json(ErrorBody {
            error_code: status.as_u16(),
            error_message,
            error_details,
        });

        (status, body).into_response()
    }
}

// The single boundary translator from engine failures to API responses.
// Validation-class failures keep their 400 status end-to-end.
impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NoFaceDetected(role) => {
                Self::NoFaceDetected(format!("No face detected in {role} image"))
            }
            EngineError::ChannelClosed => Self::InternalError("Face engine unavailable".into()),
            other => Self::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ImageRole;
    use http_body_util::BodyExt;

    async fn body_of(error: ApiError) -> (StatusCode, ErrorBody) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_invalid_input_is_400_without_details() {
        let (status, body) = body_of(ApiError::InvalidInput(
            "Invalid file type: text/plain. Only JPEG and PNG are supported.".into(),
        ))
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error_code, 400);
        assert!(body.error_message.contains("Invalid file type"));
        assert!(body.error_details.is_none());
    }

    #[tokio::test]
    async fn test_internal_error_is_500_with_details() {
        let (status, body) = body_of(ApiError::InternalError("boom".into())).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error_code, 500);
        assert_eq!(body.error_message, "Internal server error");
        assert_eq!(body.error_details.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_encode_error_is_500() {
        let (status, body) =
            body_of(ApiError::EncodeError("Failed to encode resulting image".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error_message, "Failed to encode resulting image");
    }

    #[tokio::test]
    async fn test_engine_no_face_translates_to_400() {
        let api: ApiError = EngineError::NoFaceDetected(ImageRole::Source).into();
        let (status, body) = body_of(api).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error_message, "No face detected in source image");
    }

    #[tokio::test]
    async fn test_engine_internal_translates_to_500() {
        let api: ApiError = EngineError::ChannelClosed.into();
        let (status, body) = body_of(api).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error_message, "Internal server error");
        assert!(body.error_details.is_some());
    }
}
