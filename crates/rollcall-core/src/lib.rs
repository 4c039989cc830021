//! rollcall-core: Face recognition for live attendance.
//!
//! SCRFD finds face regions and ArcFace embeds them, both via ONNX Runtime.
//! Embeddings are matched by cosine distance against the enrolled gallery
//! and each frame is annotated with the outcome.

pub mod annotate;
pub mod config;
pub mod detector;
pub mod engine;
pub mod pipeline;
pub mod recognizer;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use annotate::{Annotation, Annotator, Mark};
pub use config::{DetectorParams, RecognitionConfig};
pub use detector::{FaceDetector, ScrfdDetector};
pub use engine::{EngineError, FaceEngine};
pub use pipeline::{FrameRecognition, FrameRecognizer};
pub use recognizer::{ArcFaceExtractor, EmbeddingExtractor};
pub use types::{BoundingBox, CosineMatcher, Embedding, Gallery, KnownFace, Matcher, MatchResult, SubjectId};
