use serde::{Deserialize, Serialize};

/// Guard added to the cosine denominator so zero vectors never divide by zero.
pub const COSINE_EPSILON: f32 = 1e-8;

/// Stable integer identity of an enrolled subject (a student row id).
pub type SubjectId = i64;

/// Axis-aligned bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Integer pixel rectangle `(x, y, w, h)` clipped to a `width` x `height` frame.
    ///
    /// Returns `None` when the clipped region is empty.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Face embedding vector produced by the external extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50").
    pub model_name: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_name: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine distance `1 - (u.v) / (|u| |v| + eps)`.
    ///
    /// 0 for identical directions, 1 for orthogonal vectors, 2 for opposite ones.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        1.0 - dot / (norm_a.sqrt() * norm_b.sqrt() + COSINE_EPSILON)
    }
}

/// An enrolled subject whose embedding was loaded for matching.
#[derive(Debug, Clone)]
pub struct KnownFace {
    pub subject_id: SubjectId,
    /// Display name drawn on the frame when this subject is recognized.
    pub name: String,
    pub embedding: Embedding,
}

/// The in-memory set of known embeddings, held for the duration of one stream.
///
/// Entry order is the enumeration order used at load time; it decides
/// tie-breaks between equally distant candidates.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<KnownFace>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, face: KnownFace) {
        self.entries.push(face);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[KnownFace] {
        &self.entries
    }

    /// Subject ids in load order, parallel to [`vectors`](Self::vectors).
    pub fn ids(&self) -> impl Iterator<Item = SubjectId> + '_ {
        self.entries.iter().map(|e| e.subject_id)
    }

    /// Embeddings in load order, parallel to [`ids`](Self::ids).
    pub fn vectors(&self) -> impl Iterator<Item = &Embedding> + '_ {
        self.entries.iter().map(|e| &e.embedding)
    }

    pub fn get(&self, index: usize) -> Option<&KnownFace> {
        self.entries.get(index)
    }
}

impl FromIterator<KnownFace> for Gallery {
    fn from_iter<I: IntoIterator<Item = KnownFace>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine distance to the nearest gallery entry (`None` for an empty gallery).
    pub distance: Option<f32>,
    /// Index of the nearest gallery entry.
    pub index: Option<usize>,
    /// Subject id of the match, set only when `matched`.
    pub subject_id: Option<SubjectId>,
}

impl MatchResult {
    fn no_candidates() -> Self {
        Self { matched: false, distance: None, index: None, subject_id: None }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over cosine distance.
///
/// The nearest entry matches when its distance is strictly below the
/// threshold. Ties keep the first entry in gallery order. Entries whose
/// dimension differs from the probe are never candidates.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, vector) in gallery.vectors().enumerate() {
            if vector.dim() != probe.dim() {
                tracing::debug!(index = i, expected = probe.dim(), found = vector.dim(), "dimension mismatch; skipping");
                continue;
            }
            let dist = probe.cosine_distance(vector);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((i, dist)),
            }
        }

        let Some((idx, dist)) = best else {
            return MatchResult::no_candidates();
        };

        let matched = dist < threshold;
        MatchResult {
            matched,
            distance: Some(dist),
            index: Some(idx),
            subject_id: if matched { gallery.get(idx).map(|e| e.subject_id) } else { None },
        }
    }
}
