//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the `det_10g` detection model from the buffalo_l bundle: 640×640
//! letterboxed input, anchor-free decoding over three stride levels, NMS,
//! detections returned in confidence-descending order.

use crate::engine::types::{BoundingBox, Face, Landmarks};
use image::{RgbImage, imageops};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DET_INPUT_SIZE: usize = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DET_NMS_THRESHOLD: f32 = 0.4;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("detector inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied by the letterbox resize, kept for mapping
/// detections back to original image coordinates.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideIndices = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32], discovered by
    /// tensor name at load time with a positional fallback.
    stride_indices: [StrideIndices; 3],
}

impl FaceDetector {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD detector"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            stride_indices: discover_output_indices(&output_names),
        })
    }

    /// Detect faces in an RGB image. Returns faces sorted by descending
    /// confidence; "first face" downstream means the most confident one.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Face>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (stride_pos, &stride) in DET_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;
            let (_, kps) = outputs[kps_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("kps stride {stride}: {e}"))
            })?;

            detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                DET_CONFIDENCE_THRESHOLD,
            ));
        }

        let mut faces = nms(detections, DET_NMS_THRESHOLD);
        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(count = faces.len(), "face detection complete");
        Ok(faces)
    }
}

/// Letterbox-resize an RGB image into a normalized NCHW tensor.
///
/// The image is scaled to fit 640×640 preserving aspect ratio and centered;
/// padding stays at the normalized mean (0.0 after normalization).
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (DET_INPUT_SIZE as f32 / width as f32).min(DET_INPUT_SIZE as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).max(1);
    let new_h = ((height as f32 * scale).round() as u32).max(1);
    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

    let pad_x = (DET_INPUT_SIZE as u32 - new_w) / 2;
    let pad_y = (DET_INPUT_SIZE as u32 - new_h) / 2;

    let mut tensor = Array4::<f32>::zeros((1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - DET_MEAN) / DET_STD;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name tensors per stride ("score_8", "bbox_16",
/// "kps_32", ...) or use opaque numeric names. Falls back to the standard
/// positional layout: [0-2] scores, [3-5] bboxes, [6-8] kps.
fn discover_output_indices(names: &[String]) -> [StrideIndices; 3] {
    let find = |prefix: &str, stride: usize| names.iter().position(|n| n == &format!("{prefix}_{stride}"));

    let named = DET_STRIDES.iter().all(|&s| {
        find("score", s).is_some() && find("bbox", s).is_some() && find("kps", s).is_some()
    });

    if named {
        std::array::from_fn(|i| {
            let s = DET_STRIDES[i];
            (
                find("score", s).unwrap(),
                find("bbox", s).unwrap(),
                find("kps", s).unwrap(),
            )
        })
    } else {
        tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
        [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
    }
}

/// Decode detections for a single stride level, mapping coordinates from the
/// letterboxed input back into original image space. Anchors whose keypoint
/// block is out of range are dropped: the swap pipeline requires landmarks.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Face> {
    let grid = DET_INPUT_SIZE / stride;
    let num_anchors = grid * grid * DET_ANCHORS_PER_CELL;

    let to_image = |x: f32, y: f32| -> (f32, f32) {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut faces = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / DET_ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * stride as f32;
        let anchor_cy = (cell / grid) as f32 * stride as f32;

        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let (x1, y1) = to_image(
            anchor_cx - bboxes[bbox_off] * stride as f32,
            anchor_cy - bboxes[bbox_off + 1] * stride as f32,
        );
        let (x2, y2) = to_image(
            anchor_cx + bboxes[bbox_off + 2] * stride as f32,
            anchor_cy + bboxes[bbox_off + 3] * stride as f32,
        );

        let kps_off = idx * 10;
        if kps_off + 9 >= kps.len() {
            continue;
        }
        let mut landmarks: Landmarks = [(0.0, 0.0); 5];
        for (i, lm) in landmarks.iter_mut().enumerate() {
            *lm = to_image(
                anchor_cx + kps[kps_off + i * 2] * stride as f32,
                anchor_cy + kps[kps_off + i * 2 + 1] * stride as f32,
            );
        }

        faces.push(Face {
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            confidence: score,
            landmarks,
        });
    }

    faces
}

/// Non-maximum suppression over all stride levels.
fn nms(mut faces: Vec<Face>, iou_threshold: f32) -> Vec<Face> {
    faces.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Face> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| k.bbox.iou(&face.bbox) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Face {
        Face {
            bbox: BoundingBox {
                x,
                y,
                width: w,
                height: h,
            },
            confidence: conf,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let faces = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.9),
            face(5.0, 5.0, 100.0, 100.0, 0.8),
            face(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = nms(faces, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_disjoint() {
        let faces = vec![
            face(0.0, 0.0, 10.0, 10.0, 0.6),
            face(50.0, 50.0, 10.0, 10.0, 0.9),
        ];
        let kept = nms(faces, 0.4);
        assert_eq!(kept.len(), 2);
        // Sorted: highest confidence first.
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_discover_output_indices_by_name() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16",
            "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(discover_output_indices(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        // 320x240 image: scale 2.0, resized 640x480, vertical padding 80.
        let image = RgbImage::from_pixel(320, 240, image::Rgb([128, 128, 128]));
        let (tensor, letterbox) = preprocess(&image);

        assert_eq!(tensor.shape(), &[1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert!((letterbox.pad_x - 0.0).abs() < 1e-6);
        assert!((letterbox.pad_y - 80.0).abs() < 1e-6);

        // Padding rows stay at 0.0 (the normalized mean); 128 normalizes to
        // (128 - 127.5) / 128.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let expected = (128.0 - DET_MEAN) / DET_STD;
        assert!((tensor[[0, 0, 100, 100]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_maps_back_to_image_space() {
        // One anchor above threshold at stride 32, grid cell (2, 1), with a
        // letterbox of scale 0.5 and no padding.
        let stride = 32usize;
        let grid = DET_INPUT_SIZE / stride;
        let num_anchors = grid * grid * DET_ANCHORS_PER_CELL;

        let mut scores = vec![0.0f32; num_anchors];
        let mut bboxes = vec![0.0f32; num_anchors * 4];
        let kps = vec![0.0f32; num_anchors * 10];

        let cell = grid + 2; // (x=2, y=1)
        let idx = cell * DET_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        // Offsets of one stride in every direction.
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let letterbox = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let faces = decode_stride(&scores, &bboxes, &kps, stride, &letterbox, 0.5);

        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        // Anchor center: (64, 32) in letterbox space; box spans +-32 around
        // it; divided by scale 0.5 -> (64, 0) to (192, 128).
        assert!((f.bbox.x - 64.0).abs() < 1e-3);
        assert!((f.bbox.y - 0.0).abs() < 1e-3);
        assert!((f.bbox.width - 128.0).abs() < 1e-3);
        assert!((f.bbox.height - 128.0).abs() < 1e-3);
        // Landmarks at the anchor center, mapped by the same transform.
        assert!((f.landmarks[0].0 - 128.0).abs() < 1e-3);
        assert!((f.landmarks[0].1 - 64.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_below_threshold() {
        let stride = 32usize;
        let grid = DET_INPUT_SIZE / stride;
        let num_anchors = grid * grid * DET_ANCHORS_PER_CELL;

        let scores = vec![0.3f32; num_anchors];
        let bboxes = vec![0.0f32; num_anchors * 4];
        let kps = vec![0.0f32; num_anchors * 10];

        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        assert!(decode_stride(&scores, &bboxes, &kps, stride, &letterbox, 0.5).is_empty());
    }
}
