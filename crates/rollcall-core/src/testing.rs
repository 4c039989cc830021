//! Scripted detector and extractor for tests that must run without models.

use crate::detector::{DetectorError, FaceDetector};
use crate::engine::FaceEngine;
use crate::recognizer::{EmbeddingExtractor, ExtractorError};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};

/// Reports the bounding box of the non-black pixels in each vertical half
/// of the frame, so a frame can carry zero, one, or two "faces".
pub struct NonBlackDetector;

impl FaceDetector for NonBlackDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let half = frame.width() / 2;
        let mut regions = Vec::new();
        for (start, end) in [(0, half), (half, frame.width())] {
            let mut bounds: Option<(u32, u32, u32, u32)> = None;
            for (x, y, p) in frame.enumerate_pixels() {
                if x < start || x >= end || *p == Rgb([0, 0, 0]) {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
            if let Some((x0, y0, x1, y1)) = bounds {
                regions.push(BoundingBox {
                    x: x0 as f32,
                    y: y0 as f32,
                    width: (x1 - x0 + 1) as f32,
                    height: (y1 - y0 + 1) as f32,
                    confidence: 0.99,
                });
            }
        }
        Ok(regions)
    }
}

/// Embeds a region as its mean colour. Pure white means "no result" and
/// pure magenta means "extractor failure".
pub struct MeanColorExtractor;

impl EmbeddingExtractor for MeanColorExtractor {
    fn model_name(&self) -> &str {
        "mean_rgb"
    }

    fn extract(&mut self, face: &RgbImage) -> Result<Option<Embedding>, ExtractorError> {
        let n = (face.width() * face.height()).max(1) as f32;
        let mut sum = [0.0f32; 3];
        for p in face.pixels() {
            for c in 0..3 {
                sum[c] += p[c] as f32;
            }
        }
        let mean: Vec<f32> = sum.iter().map(|s| s / n / 255.0).collect();
        if mean == [1.0, 1.0, 1.0] {
            return Ok(None);
        }
        if mean == [1.0, 0.0, 1.0] {
            return Err(ExtractorError::InferenceFailed("scripted failure".into()));
        }
        Ok(Some(Embedding { values: mean, model_name: Some("mean_rgb".into()) }))
    }
}

pub fn engine() -> FaceEngine {
    FaceEngine::new(Box::new(NonBlackDetector), Box::new(MeanColorExtractor))
}

/// Fill a `w` x `h` block at `(x, y)` with a solid colour.
pub fn paint(frame: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
    for yy in y..(y + h).min(frame.height()) {
        for xx in x..(x + w).min(frame.width()) {
            frame.put_pixel(xx, yy, Rgb(color));
        }
    }
}
