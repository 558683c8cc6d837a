//! Contracts for the external collaborators the core consumes: the
//! embedding inference service and the ML liveness classifier.
//!
//! Capture, detection, alignment and model execution all live behind
//! these traits.

use crate::types::Embedding;
use crate::vector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Allowed deviation from unit norm for models that emit normalized embeddings.
const UNIT_NORM_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollabError {
    #[error("inference service unavailable: {0}")]
    InferenceUnavailable(String),
    #[error("liveness classifier failed: {0}")]
    ClassifierFailed(String),
    #[error("liveness classifier timed out after {0} ms")]
    LivenessTimeout(u64),
    #[error("embedding shape mismatch: {0}")]
    ShapeMismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLayout {
    Nchw,
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorOrder {
    Rgb,
    Bgr,
    Gray,
}

/// Describes what a recognition model produces, so embeddings can be
/// validated before they reach the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub dimension: usize,
    pub input_layout: InputLayout,
    pub color_order: ColorOrder,
    /// Square input edge in pixels.
    pub input_size: u32,
    /// Whether the model output is already L2-normalized.
    pub l2_normalized: bool,
}

impl ModelDescriptor {
    /// ArcFace w600k_r50: 112x112 NCHW RGB in, 512-dim normalized out.
    pub fn arcface_r50() -> Self {
        Self {
            name: "w600k_r50".into(),
            dimension: 512,
            input_layout: InputLayout::Nchw,
            color_order: ColorOrder::Rgb,
            input_size: 112,
            l2_normalized: true,
        }
    }

    /// Check that an embedding could have come from this model.
    pub fn assert_embedding_shape(&self, embedding: &Embedding) -> Result<(), CollabError> {
        if embedding.dimension() != self.dimension {
            return Err(CollabError::ShapeMismatch(format!(
                "{} expects {}-dim embeddings, got {}",
                self.name,
                self.dimension,
                embedding.dimension()
            )));
        }
        if let Some(idx) = embedding.values.iter().position(|v| !v.is_finite()) {
            return Err(CollabError::ShapeMismatch(format!(
                "non-finite value at index {idx}"
            )));
        }
        if self.l2_normalized {
            let norm = vector::l2_norm(&embedding.values);
            if (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
                return Err(CollabError::ShapeMismatch(format!(
                    "{} emits unit-norm embeddings, got norm {norm:.4}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// A captured camera frame handed to the inference service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// An aligned face crop handed to the liveness classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceCrop {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Produces embeddings from captured frames.
#[async_trait]
pub trait InferenceService: Send + Sync {
    fn descriptor(&self) -> &ModelDescriptor;

    async fn compute_embedding(&self, frame: &CapturedFrame) -> Result<Embedding, CollabError>;
}

/// Scores a face crop for liveness in [0, 1].
#[async_trait]
pub trait LivenessClassifier: Send + Sync {
    async fn score(&self, crop: &FaceCrop) -> Result<f32, CollabError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(dim: usize, normalized: bool) -> ModelDescriptor {
        ModelDescriptor {
            name: "test".into(),
            dimension: dim,
            input_layout: InputLayout::Nchw,
            color_order: ColorOrder::Gray,
            input_size: 112,
            l2_normalized: normalized,
        }
    }

    #[test]
    fn test_shape_accepts_unit_vector() {
        let d = descriptor(2, true);
        assert!(d.assert_embedding_shape(&Embedding::new(vec![0.6, 0.8])).is_ok());
    }

    #[test]
    fn test_shape_rejects_wrong_dimension() {
        let d = descriptor(3, false);
        let err = d.assert_embedding_shape(&Embedding::new(vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(err, CollabError::ShapeMismatch(_)));
    }

    #[test]
    fn test_shape_rejects_unnormalized_when_required() {
        let d = descriptor(2, true);
        assert!(d.assert_embedding_shape(&Embedding::new(vec![3.0, 4.0])).is_err());
        let raw = descriptor(2, false);
        assert!(raw.assert_embedding_shape(&Embedding::new(vec![3.0, 4.0])).is_ok());
    }

    #[test]
    fn test_shape_rejects_nan() {
        let d = descriptor(2, false);
        assert!(d.assert_embedding_shape(&Embedding::new(vec![f32::NAN, 0.0])).is_err());
    }

    #[test]
    fn test_arcface_descriptor() {
        let d = ModelDescriptor::arcface_r50();
        assert_eq!(d.dimension, 512);
        assert_eq!(d.input_size, 112);
        assert!(d.l2_normalized);
    }
}
