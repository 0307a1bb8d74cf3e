//! INSwapper face-swap model via ONNX Runtime.
//!
//! The model takes a 128×128 aligned crop of the destination face (input
//! `target`, pixels scaled to [0, 1]) and a 512-dim identity latent of the
//! source face (input `source`), and produces the swapped 128×128 crop. The
//! latent is the ArcFace embedding projected through the model's `emap`
//! matrix and re-normalized. The swapped crop is composited back into the
//! full destination image (paste-back).

use crate::engine::alignment;
use crate::engine::types::{Embedding, Face};
use byteorder::{ByteOrder, LittleEndian};
use image::RgbImage;
use ndarray::{Array2, Array4, ArrayView1, ArrayView2};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SWAP_INPUT_SIZE: u32 = 128;
const LATENT_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum SwapperError {
    #[error("swapper model not found: {0}")]
    ModelNotFound(String),
    #[error("emap file not found: {0} — export the 'emap' initializer from the swap model")]
    EmapNotFound(String),
    #[error("invalid emap: {0}")]
    InvalidEmap(String),
    #[error("invalid identity embedding: expected {LATENT_DIM} dims, got {0}")]
    InvalidEmbedding(usize),
    #[error("swapper inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceSwapper {
    session: Session,
    /// Identity projection matrix, row-major 512×512.
    emap: Vec<f32>,
}

impl FaceSwapper {
    pub fn load(
        model_path: &str,
        emap_path: &str,
        intra_threads: usize,
    ) -> Result<Self, SwapperError> {
        if !Path::new(model_path).exists() {
            return Err(SwapperError::ModelNotFound(model_path.to_string()));
        }
        let emap_bytes = std::fs::read(emap_path)
            .map_err(|_| SwapperError::EmapNotFound(emap_path.to_string()))?;
        let emap = parse_emap(&emap_bytes)?;

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, emap = emap_path, "loaded INSwapper model");
        Ok(Self { session, emap })
    }

    /// Swap the source identity onto the destination face and composite the
    /// result back into a copy of the full destination image.
    pub fn swap(
        &mut self,
        dest: &RgbImage,
        dest_face: &Face,
        source_identity: &Embedding,
    ) -> Result<RgbImage, SwapperError> {
        let matrix = alignment::estimate_to_reference(&dest_face.landmarks, SWAP_INPUT_SIZE);
        let crop = alignment::warp_into(dest, &matrix, SWAP_INPUT_SIZE);

        let target = preprocess(&crop);
        let latent = project_identity(&self.emap, source_identity)?;
        let latent =
            Array2::from_shape_vec((1, LATENT_DIM), latent).expect("latent has fixed shape");

        let outputs = self.session.run(ort::inputs![
            "target" => TensorRef::from_array_view(target.view())?,
            "source" => TensorRef::from_array_view(latent.view())?,
        ])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapperError::InferenceFailed(format!("swap output: {e}")))?;

        let swapped_crop = postprocess(data)?;
        Ok(alignment::paste_back(dest, &swapped_crop, &matrix))
    }
}

/// Parse the 512×512 little-endian f32 projection matrix.
fn parse_emap(bytes: &[u8]) -> Result<Vec<f32>, SwapperError> {
    let expected = LATENT_DIM * LATENT_DIM * size_of::<f32>();
    if bytes.len() != expected {
        return Err(SwapperError::InvalidEmap(format!(
            "expected {expected} bytes ({LATENT_DIM}x{LATENT_DIM} f32), got {}",
            bytes.len()
        )));
    }
    let mut values = vec![0.0f32; LATENT_DIM * LATENT_DIM];
    LittleEndian::read_f32_into(bytes, &mut values);
    Ok(values)
}

/// Project an identity embedding into the swap model's latent space:
/// `latent = embedding · emap`, then L2-normalize.
fn project_identity(emap: &[f32], identity: &Embedding) -> Result<Vec<f32>, SwapperError> {
    if identity.values.len() != LATENT_DIM {
        return Err(SwapperError::InvalidEmbedding(identity.values.len()));
    }

    let embedding = ArrayView1::from(&identity.values);
    let emap = ArrayView2::from_shape((LATENT_DIM, LATENT_DIM), emap)
        .map_err(|e| SwapperError::InvalidEmap(e.to_string()))?;

    let latent = embedding.dot(&emap);
    let norm = latent.dot(&latent).sqrt();
    if norm > 0.0 {
        Ok(latent.iter().map(|v| v / norm).collect())
    } else {
        Ok(latent.to_vec())
    }
}

/// Convert the aligned crop to the model's NCHW [0, 1] input tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = SWAP_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Convert the model's NCHW [0, 1] output back into an RGB crop.
fn postprocess(data: &[f32]) -> Result<RgbImage, SwapperError> {
    let size = SWAP_INPUT_SIZE as usize;
    let expected = 3 * size * size;
    if data.len() != expected {
        return Err(SwapperError::InferenceFailed(format!(
            "expected {expected} output values, got {}",
            data.len()
        )));
    }

    let plane = size * size;
    let mut out = RgbImage::new(SWAP_INPUT_SIZE, SWAP_INPUT_SIZE);
    for y in 0..size {
        for x in 0..size {
            let i = y * size + x;
            let rgb = [0, 1, 2]
                .map(|c| (data[c * plane + i] * 255.0).round().clamp(0.0, 255.0) as u8);
            out.put_pixel(x as u32, y as u32, image::Rgb(rgb));
        }
    }
    Ok(out)
}
