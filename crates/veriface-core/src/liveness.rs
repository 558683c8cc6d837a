//! Liveness fusion: motion challenge-response plus an optional ML
//! classifier score, combined into one score in [0, 1].
//!
//! The classifier is the only call in the core that may suspend. It is
//! raced against a timer; on timeout or failure the fusion falls back to
//! motion-only liveness and records why in [`LivenessDetail`].

use crate::collab::{CollabError, FaceCrop, LivenessClassifier};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Shipped defaults. Uncalibrated against field data; tune via LivenessConfig.
pub const DEFAULT_MOTION_EXPONENT: f32 = 1.5;
pub const DEFAULT_MOTION_WEIGHT: f32 = 0.4;
pub const DEFAULT_ML_WEIGHT: f32 = 0.6;
pub const DEFAULT_CLASSIFIER_TIMEOUT_MS: u64 = 500;

/// Relative weights of the two liveness signals. Renormalized on use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessWeights {
    pub motion: f32,
    pub ml: f32,
}

impl Default for LivenessWeights {
    fn default() -> Self {
        Self {
            motion: DEFAULT_MOTION_WEIGHT,
            ml: DEFAULT_ML_WEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Exponent applied to the challenge pass ratio.
    pub motion_exponent: f32,
    pub weights: LivenessWeights,
    pub classifier_timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            motion_exponent: DEFAULT_MOTION_EXPONENT,
            weights: LivenessWeights::default(),
            classifier_timeout_ms: DEFAULT_CLASSIFIER_TIMEOUT_MS,
        }
    }
}

impl LivenessConfig {
    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }
}

/// Outcome of the motion challenge-response sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionResult {
    pub challenges_passed: u32,
    pub challenges_total: u32,
}

/// What happened to the ML half of a hybrid evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlStatus {
    Scored,
    NotConfigured,
    Timeout,
    Failed,
}

/// Per-signal diagnostics attached to a [`LivenessResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessDetail {
    pub motion_score: f32,
    pub ml_score: Option<f32>,
    pub challenges_passed: u32,
    pub challenges_total: u32,
    pub ml_status: MlStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<LivenessDetail>,
}

impl LivenessResult {
    /// A bare score from a liveness source that reports no detail.
    pub fn from_score(score: f32) -> Self {
        Self { score, detail: None }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(
            self.detail.as_ref().map(|d| d.ml_status),
            Some(MlStatus::Timeout) | Some(MlStatus::Failed)
        )
    }
}

/// `(passed / total) ^ exponent`, or `0` when no challenges were issued.
pub fn motion_score(passed: u32, total: u32, exponent: f32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let ratio = (passed.min(total) as f32) / total as f32;
    ratio.powf(exponent)
}

/// Weighted average of the motion and ML scores with the weights
/// renormalized to sum to 1. Without an ML score the motion score is
/// returned unchanged.
pub fn combine(motion: f32, ml: Option<f32>, weights: LivenessWeights) -> f32 {
    let Some(ml) = ml else {
        return motion;
    };
    let total = weights.motion + weights.ml;
    if !total.is_finite() || total <= 0.0 {
        return motion;
    }
    ((weights.motion * motion + weights.ml * ml) / total).clamp(0.0, 1.0)
}

/// Simple threshold gate. The minimum comes from the effective policy.
pub fn validate(result: &LivenessResult, min_score: f32) -> bool {
    result.score.is_finite() && result.score >= min_score
}

/// Score motion synchronously, then race the ML classifier against the
/// configured timeout. Never fails: classifier problems degrade to
/// motion-only liveness.
pub async fn hybrid_evaluate(
    motion: &MotionResult,
    crop: Option<&FaceCrop>,
    classifier: Option<&dyn LivenessClassifier>,
    config: &LivenessConfig,
) -> LivenessResult {
    let motion_score = motion_score(
        motion.challenges_passed,
        motion.challenges_total,
        config.motion_exponent,
    );

    let mut detail = LivenessDetail {
        motion_score,
        ml_score: None,
        challenges_passed: motion.challenges_passed,
        challenges_total: motion.challenges_total,
        ml_status: MlStatus::NotConfigured,
        ml_error: None,
        ml_latency_ms: None,
    };

    if let (Some(classifier), Some(crop)) = (classifier, crop) {
        let started = tokio::time::Instant::now();
        let outcome =
            tokio::time::timeout(config.classifier_timeout(), classifier.score(crop)).await;
        detail.ml_latency_ms = Some(started.elapsed().as_millis() as u64);

        match outcome {
            Ok(Ok(score)) if score.is_finite() => {
                detail.ml_score = Some(score.clamp(0.0, 1.0));
                detail.ml_status = MlStatus::Scored;
            }
            Ok(Ok(score)) => {
                tracing::warn!(
                    score,
                    "liveness classifier returned non-finite score; using motion only"
                );
                detail.ml_status = MlStatus::Failed;
                detail.ml_error = Some(format!("non-finite score {score}"));
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "liveness classifier failed; using motion only");
                detail.ml_status = MlStatus::Failed;
                detail.ml_error = Some(err.to_string());
            }
            Err(_) => {
                let err = CollabError::LivenessTimeout(config.classifier_timeout_ms);
                tracing::warn!(
                    timeout_ms = config.classifier_timeout_ms,
                    "liveness classifier timed out; using motion only"
                );
                detail.ml_status = MlStatus::Timeout;
                detail.ml_error = Some(err.to_string());
            }
        }
    }

    let score = combine(motion_score, detail.ml_score, config.weights);
    tracing::debug!(
        score,
        motion_score,
        ml_score = ?detail.ml_score,
        ml_status = ?detail.ml_status,
        "liveness fused"
    );

    LivenessResult {
        score,
        detail: Some(detail),
    }
}
