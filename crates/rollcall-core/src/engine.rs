use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{EmbeddingExtractor, ExtractorError};
use crate::types::{BoundingBox, Embedding};
use image::{imageops, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
}

/// The detector and extractor pair, shared by live recognition and
/// embedding builds.
pub struct FaceEngine {
    detector: Box<dyn FaceDetector + Send>,
    extractor: Box<dyn EmbeddingExtractor + Send>,
}

impl FaceEngine {
    pub fn new(
        detector: Box<dyn FaceDetector + Send>,
        extractor: Box<dyn EmbeddingExtractor + Send>,
    ) -> Self {
        Self { detector, extractor }
    }

    pub fn model_name(&self) -> &str {
        self.extractor.model_name()
    }

    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detector.detect(frame)
    }

    /// Crop `region` out of `frame` and embed it.
    ///
    /// A region that falls entirely outside the frame yields `Ok(None)`.
    pub fn extract_region(
        &mut self,
        frame: &RgbImage,
        region: &BoundingBox,
    ) -> Result<Option<Embedding>, ExtractorError> {
        let Some((x, y, w, h)) = region.clamp_to(frame.width(), frame.height()) else {
            return Ok(None);
        };
        let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
        self.extractor.extract(&crop)
    }

    /// Embed a canonical photo without requiring a detected face.
    ///
    /// Uses the most confident detected region when there is one and the
    /// whole image otherwise.
    pub fn represent(&mut self, photo: &RgbImage) -> Result<Option<Embedding>, EngineError> {
        let faces = self.detector.detect(photo)?;
        let embedding = match faces.first() {
            Some(face) => {
                tracing::debug!(confidence = face.confidence, "represent: using detected face");
                self.extract_region(photo, face)?
            }
            None => {
                tracing::debug!("represent: no face detected, embedding whole image");
                self.extractor.extract(photo)?
            }
        };
        Ok(embedding)
    }
}
