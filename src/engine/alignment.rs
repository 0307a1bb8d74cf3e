//! Landmark-based face alignment.
//!
//! Estimates a 4-DOF similarity transform (scale, rotation, translation) from
//! the five detected landmarks to the canonical InsightFace positions, warps
//! the face into a square crop for the downstream models, and pastes a
//! processed crop back into the full image with a feathered blend.

use crate::engine::types::Landmarks;
use image::RgbImage;

/// Canonical ArcFace landmark positions on a 112×112 grid.
const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;

/// Width in pixels of the soft border used when compositing a crop back
/// into the destination image.
const PASTE_FEATHER_PX: f32 = 8.0;

/// Canonical landmark positions scaled to a `size`×`size` grid.
pub fn reference_landmarks(size: u32) -> Landmarks {
    let factor = size as f32 / REFERENCE_SIZE;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * factor, y * factor))
}

/// Estimate the similarity transform mapping `landmarks` (in image
/// coordinates) onto the canonical grid of the given crop size.
pub fn estimate_to_reference(landmarks: &Landmarks, crop_size: u32) -> [f32; 6] {
    estimate_similarity_transform(landmarks, &reference_landmarks(crop_size))
}

/// Least-squares 4-DOF similarity transform from `src` points to `dst`
/// points. Returned as row-major `[a, -b, tx, b, a, ty]`:
///
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub fn estimate_similarity_transform(src: &Landmarks, dst: &Landmarks) -> [f32; 6] {
    // Overdetermined system A * [a, b, tx, ty]^T = B; each point pair
    // contributes two rows:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];

        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j * 4 + k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting for the 4×4 normal equations.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[max_row][col].abs() {
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // degenerate landmarks; identity-ish
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Apply a 2×3 transform to a point.
fn apply(matrix: &[f32; 6], x: f32, y: f32) -> (f32, f32) {
    (
        matrix[0] * x + matrix[1] * y + matrix[2],
        matrix[3] * x + matrix[4] * y + matrix[5],
    )
}

/// Invert a similarity transform produced by [`estimate_similarity_transform`].
pub fn invert_similarity(matrix: &[f32; 6]) -> [f32; 6] {
    let (a, b) = (matrix[0], matrix[3]);
    let (tx, ty) = (matrix[2], matrix[5]);

    // M = [[a, -b], [b, a]], det = a² + b²
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    }
    let ia = a / det;
    let ib = b / det;

    [
        ia,
        ib,
        -(ia * tx + ib * ty),
        -ib,
        ia,
        ib * tx - ia * ty,
    ]
}

/// Bilinear sample of an RGB image. Out-of-bounds contributions are black.
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let fetch = |px: i32, py: i32| -> [f32; 3] {
        if px >= 0 && px < w && py >= 0 && py < h {
            let p = image.get_pixel(px as u32, py as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        out[c] = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
    }
    out
}

/// Warp the image through `matrix` into a `size`×`size` crop.
///
/// `matrix` maps image coordinates to crop coordinates; each output pixel is
/// sampled from the inverse mapping with bilinear interpolation.
pub fn warp_into(image: &RgbImage, matrix: &[f32; 6], size: u32) -> RgbImage {
    let inv = invert_similarity(matrix);
    let mut out = RgbImage::new(size, size);

    for oy in 0..size {
        for ox in 0..size {
            let (sx, sy) = apply(&inv, ox as f32, oy as f32);
            let rgb = sample_bilinear(image, sx, sy);
            out.put_pixel(
                ox,
                oy,
                image::Rgb(rgb.map(|v| v.round().clamp(0.0, 255.0) as u8)),
            );
        }
    }
    out
}

/// Align a face to the canonical `size`×`size` crop using its landmarks.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks, size: u32) -> RgbImage {
    let matrix = estimate_to_reference(landmarks, size);
    warp_into(image, &matrix, size)
}

/// Composite a processed crop back into the full image.
///
/// `matrix` is the transform that produced the crop (image → crop
/// coordinates). Pixels whose mapping falls inside the crop are replaced,
/// with alpha ramping down over [`PASTE_FEATHER_PX`] near the crop border so
/// the seam does not show.
pub fn paste_back(image: &RgbImage, crop: &RgbImage, matrix: &[f32; 6]) -> RgbImage {
    let size = crop.width() as f32;
    let inv = invert_similarity(matrix);

    // Bound the affected region by mapping the crop corners into image space.
    let corners = [(0.0, 0.0), (size, 0.0), (0.0, size), (size, size)]
        .map(|(cx, cy)| apply(&inv, cx, cy));
    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min);
    let max_x = corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min);
    let max_y = corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max);

    let x0 = min_x.floor().max(0.0) as u32;
    let y0 = min_y.floor().max(0.0) as u32;
    let x1 = (max_x.ceil() as u32 + 1).min(image.width());
    let y1 = (max_y.ceil() as u32 + 1).min(image.height());

    let mut out = image.clone();

    for y in y0..y1 {
        for x in x0..x1 {
            let (cx, cy) = apply(matrix, x as f32, y as f32);
            if cx < 0.0 || cy < 0.0 || cx >= size || cy >= size {
                continue;
            }

            // Distance to the nearest crop edge controls the blend weight.
            let edge_dist = cx.min(size - 1.0 - cx).min(cy).min(size - 1.0 - cy);
            let alpha = (edge_dist / PASTE_FEATHER_PX).clamp(0.0, 1.0);
            if alpha <= 0.0 {
                continue;
            }

            let swapped = sample_bilinear(crop, cx, cy);
            let base = out.get_pixel(x, y);
            let blended = [0, 1, 2].map(|c| {
                let v = base[c] as f32 * (1.0 - alpha) + swapped[c] * alpha;
                v.round().clamp(0.0, 255.0) as u8
            });
            out.put_pixel(x, y, image::Rgb(blended));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_src_equals_dst() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_double_scale_landmarks_halved() {
        // Landmarks at 2x the reference positions should produce scale ~0.5.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.01, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_invert_similarity_round_trip() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 1.7 + 20.0, y * 1.7 - 5.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        let inv = invert_similarity(&m);

        for (x, y) in [(10.0f32, 20.0f32), (100.0, 40.0), (55.5, 91.25)] {
            let (fx, fy) = apply(&m, x, y);
            let (bx, by) = apply(&inv, fx, fy);
            assert!((bx - x).abs() < 1e-2, "x: {bx} vs {x}");
            assert!((by - y).abs() < 1e-2, "y: {by} vs {y}");
        }
    }

    #[test]
    fn test_reference_landmarks_scaling() {
        let at_112 = reference_landmarks(112);
        assert_eq!(at_112, REFERENCE_LANDMARKS_112);

        let at_128 = reference_landmarks(128);
        let factor = 128.0 / 112.0;
        for i in 0..5 {
            assert!((at_128[i].0 - REFERENCE_LANDMARKS_112[i].0 * factor).abs() < 1e-4);
            assert!((at_128[i].1 - REFERENCE_LANDMARKS_112[i].1 * factor).abs() < 1e-4);
        }
    }

    #[test]
    fn test_warp_output_dimensions() {
        let image = RgbImage::from_pixel(640, 480, image::Rgb([128, 64, 32]));
        let m = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let out = warp_into(&image, &m, 112);
        assert_eq!(out.dimensions(), (112, 112));
        // Identity warp inside bounds preserves pixel values.
        assert_eq!(out.get_pixel(50, 50), &image::Rgb([128, 64, 32]));
    }

    #[test]
    fn test_align_face_moves_landmark_to_reference() {
        let mut image = RgbImage::new(200, 200);
        let landmarks: Landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // Bright patch at the left-eye landmark; it should land near the
        // canonical left-eye position after alignment.
        for dy in 0..5u32 {
            for dx in 0..5u32 {
                let px = 78 + dx;
                let py = 58 + dy;
                image.put_pixel(px, py, image::Rgb([255, 255, 255]));
            }
        }

        let aligned = align_face(&image, &landmarks, 112);
        let (ref_x, ref_y) = REFERENCE_LANDMARKS_112[0];

        let mut max_val = 0u8;
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let x = (ref_x.round() as i32 + dx).clamp(0, 111) as u32;
                let y = (ref_y.round() as i32 + dy).clamp(0, 111) as u32;
                max_val = max_val.max(aligned.get_pixel(x, y)[0]);
            }
        }
        assert!(max_val > 100, "expected bright patch near reference left eye, max={max_val}");
    }

    #[test]
    fn test_paste_back_only_touches_crop_region() {
        let image = RgbImage::from_pixel(300, 300, image::Rgb([10, 10, 10]));
        let crop = RgbImage::from_pixel(128, 128, image::Rgb([200, 200, 200]));

        // Crop taken from the region around (100..228, 100..228).
        let m = [1.0, 0.0, -100.0, 0.0, 1.0, -100.0];
        let out = paste_back(&image, &crop, &m);

        // Far outside the crop region: untouched.
        assert_eq!(out.get_pixel(10, 10), &image::Rgb([10, 10, 10]));
        assert_eq!(out.get_pixel(290, 290), &image::Rgb([10, 10, 10]));

        // Center of the crop region: fully replaced.
        assert_eq!(out.get_pixel(164, 164), &image::Rgb([200, 200, 200]));

        // Just inside the border: partially blended.
        let edge = out.get_pixel(102, 164);
        assert!(edge[0] > 10 && edge[0] < 200, "edge pixel should blend, got {}", edge[0]);
    }

    #[test]
    fn test_paste_back_preserves_dimensions() {
        let image = RgbImage::new(123, 77);
        let crop = RgbImage::new(128, 128);
        let m = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let out = paste_back(&image, &crop, &m);
        assert_eq!(out.dimensions(), (123, 77));
    }
}
