use serde::{Deserialize, Serialize};

/// Default embedding model; also the suffix of every embedding file name.
pub const DEFAULT_MODEL_NAME: &str = "w600k_r50";
/// Cosine distance strictly below which a face counts as recognized.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.65;

/// Fixed tuning for the face-region detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Minimum detection score for a candidate region.
    pub confidence_threshold: f32,
    /// IoU above which overlapping candidates are suppressed.
    pub nms_threshold: f32,
    /// Square input edge the detector letterboxes frames into.
    pub input_size: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self { confidence_threshold: 0.5, nms_threshold: 0.4, input_size: 640 }
    }
}

/// Recognition settings handed to the frame recognizer and the embedding
/// builder when they are constructed. Not adjustable per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub model_name: String,
    pub distance_threshold: f32,
    pub detector: DetectorParams,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            detector: DetectorParams::default(),
        }
    }
}
