use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Face embedding vector (128-dimensional for the extractors seen in practice).
///
/// The matcher treats the values as plain vector components. Embeddings are
/// only meaningfully comparable when the same extractor produced both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Extractor that produced this embedding (e.g., "human", "face-api").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,
}

/// Why two embeddings could not be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// One of the vectors has no components.
    Empty,
    /// The vectors have different dimensions.
    LengthMismatch { expected: usize, actual: usize },
    /// A component is NaN or infinite.
    NonFinite,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Empty => write!(f, "empty embedding"),
            SkipReason::LengthMismatch { expected, actual } => {
                write!(f, "length mismatch: expected {expected}, got {actual}")
            }
            SkipReason::NonFinite => write!(f, "non-finite component"),
        }
    }
}

impl Embedding {
    /// Build an embedding with no extractor tag.
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            extractor: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Check that this embedding is usable on its own: non-empty, all finite.
    pub fn validate(&self) -> Result<(), SkipReason> {
        if self.values.is_empty() {
            return Err(SkipReason::Empty);
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(SkipReason::NonFinite);
        }
        Ok(())
    }

    /// Check that `other` can be compared against `self`.
    ///
    /// `expected` in a length mismatch is always `self`'s dimension.
    pub fn check_comparable(&self, other: &Embedding) -> Result<(), SkipReason> {
        if self.values.len() != other.values.len() {
            return Err(SkipReason::LengthMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        self.validate()?;
        other.validate()
    }

    /// Cosine similarity between two embeddings.
    ///
    /// Returns `None` when the pair cannot be compared (different lengths,
    /// empty, or non-finite components). Returns `Some(0.0)` when either
    /// vector has zero magnitude. Otherwise the value lies in [-1, 1].
    ///
    /// Accumulates in f64 and divides by `sqrt(‖a‖² · ‖b‖²)`, which keeps the
    /// result exactly symmetric and makes `similarity(v, v)` exactly 1.0.
    pub fn similarity(&self, other: &Embedding) -> Option<f32> {
        self.check_comparable(other).ok()?;

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(*a), f64::from(*b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return Some(0.0);
        }

        let cos = dot / (norm_a * norm_b).sqrt();
        Some(cos.clamp(-1.0, 1.0) as f32)
    }

    /// Euclidean distance between two embeddings, `None` if incomparable.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        self.check_comparable(other).ok()?;
        let sum: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (f64::from(*a) - f64::from(*b)).powi(2))
            .sum();
        Some(sum.sqrt() as f32)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Descriptive data stored alongside an enrolled embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub display_name: Option<String>,
    /// Scoping key used to narrow candidate sets (e.g., study stage).
    pub group: Option<String>,
    /// Reference to the captured image, if one was kept.
    pub image_ref: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

impl Default for RecordMetadata {
    fn default() -> Self {
        Self {
            display_name: None,
            group: None,
            image_ref: None,
            enrolled_at: Utc::now(),
        }
    }
}

/// A stored face embedding and the identity it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledRecord {
    /// Opaque identity reference (e.g., student id).
    pub identity: String,
    pub embedding: Embedding,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl EnrolledRecord {
    pub fn new(identity: impl Into<String>, embedding: impl Into<Embedding>) -> Self {
        Self {
            identity: identity.into(),
            embedding: embedding.into(),
            metadata: RecordMetadata::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.display_name = Some(name.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.metadata.group = Some(group.into());
        self
    }
}

/// Result of matching a query embedding against enrolled records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Identity of the closest comparable candidate, even below threshold.
    pub best_identity: Option<String>,
    /// Similarity of the closest candidate; 0.0 when nothing was comparable.
    pub similarity: f32,
    /// Human-readable status, including the similarity percentage.
    pub message: String,
    /// Number of candidates excluded as incomparable.
    pub skipped: usize,
}

impl MatchResult {
    /// Result for an empty candidate set.
    pub fn no_candidates() -> Self {
        Self {
            matched: false,
            best_identity: None,
            similarity: 0.0,
            message: "no candidates".to_string(),
            skipped: 0,
        }
    }

    /// Result when every candidate was skipped as incomparable.
    pub fn nothing_comparable(skipped: usize) -> Self {
        Self {
            matched: false,
            best_identity: None,
            similarity: 0.0,
            message: format!("no comparable candidates ({skipped} skipped)"),
            skipped,
        }
    }

    /// Result for a query embedding that cannot be compared with anything.
    /// No candidate is considered, so none is counted as skipped.
    pub fn unusable_query(reason: SkipReason) -> Self {
        Self {
            matched: false,
            best_identity: None,
            similarity: 0.0,
            message: format!("unusable query embedding: {reason}"),
            skipped: 0,
        }
    }

    /// Similarity as a percentage string with two decimals, e.g. "99.40%".
    pub fn percentage(&self) -> String {
        format_percentage(self.similarity)
    }
}

pub(crate) fn format_percentage(similarity: f32) -> String {
    format!("{:.2}%", similarity * 100.0)
}
