//! ArcFace identity embedder via ONNX Runtime.
//!
//! Produces the 512-dimensional identity embedding of a detected face from
//! its 112×112 aligned crop (w600k_r50, from the buffalo_l bundle). The swap
//! model consumes the source face as this embedding, not as pixels.

use crate::engine::alignment;
use crate::engine::types::{Embedding, Face};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
// Symmetric normalization; the detector's 128.0 does not apply here.
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer model not found: {0}")]
    ModelNotFound(String),
    #[error("recognizer inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace recognizer");
        Ok(Self { session })
    }

    /// Extract the L2-normalized identity embedding of a detected face.
    pub fn extract(&mut self, image: &RgbImage, face: &Face) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(image, &face.landmarks, ARCFACE_INPUT_SIZE);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|v| v / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(Embedding { values })
    }
}

/// Convert a 112×112 aligned RGB crop into a normalized NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape() {
        let crop = RgbImage::new(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE);
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_range() {
        let crop = RgbImage::from_pixel(
            ARCFACE_INPUT_SIZE,
            ARCFACE_INPUT_SIZE,
            image::Rgb([0, 128, 255]),
        );
        let tensor = preprocess(&crop);

        // 0 -> -1.0, 255 -> +1.0, 128 -> just above 0.
        assert!((tensor[[0, 0, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
        let mid = tensor[[0, 1, 0, 0]];
        assert!(mid > 0.0 && mid < 0.01, "mid = {mid}");
    }

    #[test]
    fn test_preprocess_channel_layout() {
        // Distinct channel values must land in distinct planes.
        let crop = RgbImage::from_pixel(
            ARCFACE_INPUT_SIZE,
            ARCFACE_INPUT_SIZE,
            image::Rgb([10, 20, 30]),
        );
        let tensor = preprocess(&crop);
        let r = tensor[[0, 0, 50, 50]];
        let g = tensor[[0, 1, 50, 50]];
        let b = tensor[[0, 2, 50, 50]];
        assert!(r < g && g < b);
    }
}
