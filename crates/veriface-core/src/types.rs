use serde::{Deserialize, Serialize};

use crate::vector::{self, VectorError};

/// Identity embedding vector (typically 512-dimensional for ArcFace-class models).
///
/// Produced once by the inference service and treated as an immutable value;
/// every transform in this crate returns a new vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Remapped cosine similarity in [0, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, VectorError> {
        vector::cosine_similarity(&self.values, &other.values, true)
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, VectorError> {
        vector::euclidean_distance(&self.values, &other.values)
    }

    /// Unit-length copy of this embedding.
    pub fn normalized(&self) -> Embedding {
        Embedding {
            values: vector::normalize(&self.values),
            model_version: self.model_version.clone(),
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A known identity's stored biometric reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub identity_id: String,
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Comparison metric used to produce a [`MatchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Cosine,
    Euclidean,
}

/// Outcome of comparing a live embedding against one reference embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Similarity in [0, 1].
    pub score: f32,
    pub distance: f32,
    pub method: MatchMethod,
    pub normalized: bool,
}

/// A candidate's position in a ranked shortlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// Index into the population the shortlist was drawn from.
    pub index: usize,
    pub identity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub score: f32,
    /// 1-based rank; 1 is the best.
    pub rank: usize,
}
