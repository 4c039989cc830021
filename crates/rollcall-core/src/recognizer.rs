//! Embedding extraction.
//!
//! [`EmbeddingExtractor`] turns an image region into a fixed-length vector.
//! [`ArcFaceExtractor`] implements it with an ArcFace model under ONNX Runtime.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Computes a face embedding for an image region.
pub trait EmbeddingExtractor {
    /// Name of the model producing the vectors; part of the embedding file name.
    fn model_name(&self) -> &str;

    /// Embed `face`. `Ok(None)` means the model produced no usable result.
    fn extract(&mut self, face: &RgbImage) -> Result<Option<Embedding>, ExtractorError>;
}

/// ArcFace-based embedding extractor.
pub struct ArcFaceExtractor {
    session: Session,
    model_name: String,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model; `model_name` tags every vector it produces.
    pub fn load(model_path: &Path, model_name: &str) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = model_name,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session, model_name: model_name.to_string() })
    }

    /// Resize a face crop to 112x112 and lay it out as a normalized NCHW tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let resized = imageops::resize(face, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl EmbeddingExtractor for ArcFaceExtractor {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn extract(&mut self, face: &RgbImage) -> Result<Option<Embedding>, ExtractorError> {
        if face.width() == 0 || face.height() == 0 {
            return Ok(None);
        }

        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        let values = l2_normalize(raw_data);
        if values.iter().any(|v| !v.is_finite()) {
            return Ok(None);
        }

        Ok(Some(Embedding { values, model_name: Some(self.model_name.clone()) }))
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(40, 60, Rgb([128, 128, 128]));
        let tensor = ArcFaceExtractor::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalizes_per_channel() {
        let face = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = ArcFaceExtractor::preprocess(&face);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
