//! Face-region detection.
//!
//! [`FaceDetector`] is the seam the recognizer depends on; [`ScrfdDetector`]
//! implements it with an SCRFD model running under ONNX Runtime (3-stride
//! anchor decoding followed by NMS).

use crate::config::DetectorParams;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds candidate face regions in an RGB frame.
pub trait FaceDetector {
    /// Return zero or more regions, highest confidence first.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    params: DetectorParams,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, params: DetectorParams) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self { session, params, stride_indices })
    }

    /// Letterbox an RGB frame into the square detector input as a NCHW tensor.
    fn preprocess(&self, frame: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let size = self.params.input_size;
        let (width, height) = frame.dimensions();

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;

        let resized = imageops::resize(frame, new_w as u32, new_h as u32, FilterType::Triangle);

        // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let x_off = pad_x.floor() as usize;
        let y_off = pad_y.floor() as usize;

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + x_off, y as usize + y_off);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.params.input_size,
                &letterbox,
                self.params.confidence_threshold,
            ));
        }

        Ok(nms(candidates, self.params.nms_threshold))
    }
}

/// Map each stride to its (score, bbox) output tensors.
///
/// Exports either name tensors "score_8", "bbox_16", ... or use generic names
/// in the standard order [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode candidate boxes for a single stride level, mapped back to frame space.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        let x1 = (anchor_x - offsets[0] * step - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_y - offsets[1] * step - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_x + offsets[2] * step - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_y + offsets[3] * step - letterbox.pad_y) / letterbox.scale;

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression; the survivors come back sorted by confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter_area = inter_w * inter_h;
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // 50 / (100 + 100 - 50)
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_decode_stride_maps_back_through_letterbox() {
        // One anchor at cell (1, 1) of a stride-32 grid over a 64px input.
        let input_size = 64;
        let stride = 32;
        let grid = input_size / stride;
        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        let mut bboxes = vec![0.0f32; scores.len() * 4];
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 16.0 };
        let dets = decode_stride(&scores, &bboxes, stride, input_size, &letterbox, 0.5);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // anchor (32, 32), box 16..48 in input space
        assert!((d.x - 8.0).abs() < 1e-4);
        assert!((d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 16.0).abs() < 1e-4);
        assert!((d.height - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_skips_low_scores() {
        let scores = vec![0.5f32; 8];
        let bboxes = vec![1.0f32; 32];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, 32, 64, &letterbox, 0.5).is_empty());
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }
}
