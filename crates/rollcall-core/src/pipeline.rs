//! Per-frame recognition: detect, embed, match, annotate.

use crate::annotate::{Annotation, Annotator, Mark};
use crate::config::RecognitionConfig;
use crate::detector::DetectorError;
use crate::engine::FaceEngine;
use crate::types::{CosineMatcher, Gallery, Matcher, SubjectId};
use image::RgbImage;
use std::collections::BTreeSet;

/// Outcome of recognizing one frame. The frame itself is annotated in place.
#[derive(Debug, Default)]
pub struct FrameRecognition {
    pub recognized: BTreeSet<SubjectId>,
    pub annotations: Vec<Annotation>,
}

/// Recognizes known subjects in camera frames.
pub struct FrameRecognizer {
    config: RecognitionConfig,
    annotator: Annotator,
}

impl FrameRecognizer {
    pub fn new(config: RecognitionConfig, annotator: Annotator) -> Self {
        Self { config, annotator }
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    /// Recognize every detected face in `frame` against `gallery`, drawing a
    /// mark for each region.
    ///
    /// Extraction problems on a single region mark that region and move on.
    /// Only a detector failure aborts the frame.
    pub fn recognize(
        &self,
        engine: &mut FaceEngine,
        frame: &mut RgbImage,
        gallery: &Gallery,
    ) -> Result<FrameRecognition, DetectorError> {
        let regions = engine.detect(frame)?;
        let mut outcome = FrameRecognition::default();

        for region in regions {
            let mark = match engine.extract_region(frame, &region) {
                Err(error) => {
                    tracing::warn!(%error, x = region.x, y = region.y, "embedding failed for region");
                    Mark::Error
                }
                Ok(None) => Mark::NoFace,
                Ok(Some(_)) if gallery.is_empty() => Mark::Unknown,
                Ok(Some(probe)) => {
                    let result = CosineMatcher.compare(&probe, gallery, self.config.distance_threshold);
                    tracing::debug!(
                        distance = ?result.distance,
                        threshold = self.config.distance_threshold,
                        "best match"
                    );
                    match result.index.and_then(|i| gallery.get(i)).filter(|_| result.matched) {
                        Some(known) => {
                            tracing::info!(
                                subject_id = known.subject_id,
                                name = %known.name,
                                distance = ?result.distance,
                                "recognized"
                            );
                            outcome.recognized.insert(known.subject_id);
                            Mark::Recognized { name: known.name.clone() }
                        }
                        None => Mark::Unknown,
                    }
                }
            };
            outcome.annotations.push(Annotation { region, mark });
        }

        for annotation in &outcome.annotations {
            self.annotator.draw(frame, annotation);
        }

        Ok(outcome)
    }
}
