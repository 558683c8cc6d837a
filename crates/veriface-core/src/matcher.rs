//! Candidate matching orchestration: shortlist, best-candidate selection,
//! policy resolution, liveness validation and the final decision, packaged
//! for logging and transport.

use crate::collab::{CapturedFrame, CollabError, FaceCrop, InferenceService, LivenessClassifier};
use crate::decision::{self, Decision, DecisionInput, DecisionReason};
use crate::liveness::{self, LivenessConfig, LivenessResult, MotionResult};
use crate::policy::{merge_overrides, Policy};
use crate::types::{Candidate, Embedding, MatchMethod, MatchResult, ScoredCandidate};
use crate::vector::{self, CachedEmbedding, VectorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_SHORTLIST_K: usize = 10;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Collab(#[from] CollabError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Shortlist size handed to exact re-scoring.
    pub shortlist_k: usize,
    /// Minimum fast-path score for a candidate to be shortlisted.
    pub shortlist_floor: f32,
    /// Attach the live embedding to every package. Enrollment/audit use only.
    pub include_embedding: bool,
    pub liveness: LivenessConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shortlist_k: DEFAULT_SHORTLIST_K,
            shortlist_floor: 0.0,
            include_embedding: false,
            liveness: LivenessConfig::default(),
        }
    }
}

/// A candidate with its normalized reference precomputed.
#[derive(Debug, Clone)]
pub struct CachedCandidate {
    pub candidate: Candidate,
    pub cached: CachedEmbedding,
}

/// Immutable, versioned candidate population. Replace it wholesale when
/// enrollment changes; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    version: u64,
    dimension: Option<usize>,
    entries: Vec<CachedCandidate>,
}

impl CandidateSet {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CachedCandidate] {
        &self.entries
    }

    /// Top `k` candidates by fast cosine similarity at or above `floor`.
    pub fn shortlist(
        &self,
        live: &[f32],
        k: usize,
        floor: f32,
    ) -> Result<Vec<ScoredCandidate>, VectorError> {
        let scores = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| Ok((i, vector::fast_cosine_similarity(live, &e.cached)?)))
            .collect::<Result<Vec<_>, VectorError>>()?;

        Ok(vector::rank_top_k(scores, k, floor)
            .into_iter()
            .enumerate()
            .map(|(pos, (i, score))| self.scored(i, score, pos + 1))
            .collect())
    }

    fn scored(&self, index: usize, score: f32, rank: usize) -> ScoredCandidate {
        let c = &self.entries[index].candidate;
        ScoredCandidate {
            index,
            identity_id: c.identity_id.clone(),
            role: c.role.clone(),
            score,
            rank,
        }
    }
}

/// Precompute normalized references for a candidate population.
///
/// All candidates must share one dimension.
pub fn pre_cache(candidates: Vec<Candidate>, version: u64) -> Result<CandidateSet, VectorError> {
    let dimension = candidates.first().map(|c| c.embedding.dimension());
    let entries = candidates
        .into_iter()
        .map(|candidate| {
            let dim = candidate.embedding.dimension();
            if let Some(expected) = dimension {
                if dim != expected {
                    return Err(VectorError::DimensionMismatch { expected, actual: dim });
                }
            }
            let cached = CachedEmbedding::new(&candidate.embedding.values);
            Ok(CachedCandidate { candidate, cached })
        })
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!(version, count = entries.len(), dimension = ?dimension, "candidate set cached");
    Ok(CandidateSet {
        version,
        dimension,
        entries,
    })
}

/// Where and when a capture happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchContext {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    pub live: Embedding,
    #[serde(default)]
    pub liveness: Option<LivenessResult>,
    #[serde(default)]
    pub secondary_score: Option<f32>,
    pub context: MatchContext,
    /// Use this policy instead of the current store snapshot.
    #[serde(default)]
    pub policy_override: Option<Policy>,
    #[serde(default)]
    pub include_embedding: bool,
}

/// Everything a caller, audit log or transport needs about one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPackage {
    pub decision_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub context: MatchContext,
    pub identity_id: Option<String>,
    pub role: Option<String>,
    pub policy_version: u64,
    pub candidate_set_version: u64,
    pub match_result: Option<MatchResult>,
    pub shortlist: Vec<ScoredCandidate>,
    pub liveness: Option<LivenessResult>,
    pub liveness_valid: Option<bool>,
    pub secondary_score: Option<f32>,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
}

impl DecisionPackage {
    /// A `Rejected / processing_error` package for a request that failed.
    pub fn fail_safe(
        context: MatchContext,
        policy_version: u64,
        candidate_set_version: u64,
        detail: &str,
    ) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            created_at: Utc::now(),
            context,
            identity_id: None,
            role: None,
            policy_version,
            candidate_set_version,
            match_result: None,
            shortlist: Vec::new(),
            liveness: None,
            liveness_valid: None,
            secondary_score: None,
            decision: Decision::fail_safe(DecisionReason::ProcessingError, "processing", detail),
            embedding: None,
        }
    }
}

/// Inputs for [`Orchestrator::decide_from_frame`].
#[derive(Debug, Clone)]
pub struct FrameRequest {
    pub frame: CapturedFrame,
    pub crop: Option<FaceCrop>,
    pub motion: Option<MotionResult>,
    pub secondary_score: Option<f32>,
    pub context: MatchContext,
    pub include_embedding: bool,
}

/// External services used by the frame path.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub inference: &'a dyn InferenceService,
    pub classifier: Option<&'a dyn LivenessClassifier>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Match one live embedding against the population and decide.
    ///
    /// Only a dimension mismatch between the live embedding and the
    /// population is returned as an error.
    pub fn match_and_decide(
        &self,
        request: &MatchRequest,
        candidates: &CandidateSet,
        policy: &Policy,
    ) -> Result<DecisionPackage, MatchError> {
        let policy = request.policy_override.as_ref().unwrap_or(policy);
        let live = &request.live.values;

        let fast =
            candidates.shortlist(live, self.config.shortlist_k, self.config.shortlist_floor)?;

        // Exact re-score of the shortlist; stable ordering keeps first-seen ties.
        let exact = fast
            .iter()
            .map(|s| {
                let reference = &candidates.entries[s.index].candidate.embedding.values;
                Ok((s.index, vector::cosine_similarity(live, reference, true)?))
            })
            .collect::<Result<Vec<_>, VectorError>>()?;
        let shortlist: Vec<ScoredCandidate> =
            vector::rank_top_k(exact, fast.len(), f32::NEG_INFINITY)
                .into_iter()
                .enumerate()
                .map(|(pos, (i, score))| candidates.scored(i, score, pos + 1))
                .collect();

        let best = shortlist.first();
        let effective = merge_overrides(
            policy,
            best.and_then(|b| b.role.as_deref()),
            best.map(|b| b.identity_id.as_str()),
        );

        let match_result = best
            .map(|b| {
                let reference = &candidates.entries[b.index].candidate.embedding.values;
                vector::compare(live, reference, MatchMethod::Cosine)
            })
            .transpose()?;

        let candidate_count = match best {
            Some(_) => {
                1 + shortlist[1..]
                    .iter()
                    .filter(|s| s.score >= effective.rules.global_match_threshold)
                    .count()
            }
            None => 0,
        };

        let liveness_valid = request
            .liveness
            .as_ref()
            .map(|l| liveness::validate(l, effective.rules.liveness_min));
        if liveness_valid == Some(false) {
            tracing::debug!(min = effective.rules.liveness_min, "liveness below policy minimum");
        }

        let decision = decision::decide(
            &DecisionInput {
                match_score: match_result.map(|m| m.score),
                liveness_score: request.liveness.as_ref().map(|l| l.score),
                secondary_score: request.secondary_score,
                candidate_count,
            },
            &effective.rules,
        );

        tracing::info!(
            device = %request.context.device_id,
            identity = best.map(|b| b.identity_id.as_str()),
            status = decision.status.as_str(),
            reason = decision.primary_reason.map(|r| r.as_str()),
            confidence = decision.confidence,
            shortlisted = shortlist.len(),
            candidate_count,
            policy_version = effective.version,
            "match decided"
        );

        let include_embedding = request.include_embedding || self.config.include_embedding;
        Ok(DecisionPackage {
            decision_id: Uuid::new_v4(),
            created_at: Utc::now(),
            context: request.context.clone(),
            identity_id: best.map(|b| b.identity_id.clone()),
            role: best.and_then(|b| b.role.clone()),
            policy_version: effective.version,
            candidate_set_version: candidates.version(),
            match_result,
            liveness: request.liveness.clone(),
            liveness_valid,
            secondary_score: request.secondary_score,
            decision,
            embedding: include_embedding.then(|| request.live.clone()),
            shortlist,
        })
    }

    /// Process requests in order. A failing request yields a
    /// `Rejected / processing_error` package and the batch continues.
    pub fn batch_match_and_decide(
        &self,
        requests: &[MatchRequest],
        candidates: &CandidateSet,
        policy: &Policy,
    ) -> Vec<DecisionPackage> {
        requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.match_and_decide(request, candidates, policy)
                }));
                let detail = match outcome {
                    Ok(Ok(package)) => return package,
                    Ok(Err(err)) => err.to_string(),
                    Err(_) => "panic while matching".to_string(),
                };
                tracing::warn!(
                    item = i,
                    error = %detail,
                    "batch item failed; emitting fail-safe rejection"
                );
                let version = request.policy_override.as_ref().unwrap_or(policy).version;
                DecisionPackage::fail_safe(
                    request.context.clone(),
                    version,
                    candidates.version(),
                    &detail,
                )
            })
            .collect()
    }

    /// Full pipeline from a captured frame: inference, shape check, hybrid
    /// liveness, then [`match_and_decide`](Self::match_and_decide).
    ///
    /// An unavailable inference service yields a `processing_error`
    /// rejection instead of an error.
    pub async fn decide_from_frame(
        &self,
        request: FrameRequest,
        collaborators: Collaborators<'_>,
        candidates: &CandidateSet,
        policy: &Policy,
    ) -> Result<DecisionPackage, MatchError> {
        let embedding = match collaborators.inference.compute_embedding(&request.frame).await {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "inference unavailable; rejecting capture");
                return Ok(DecisionPackage::fail_safe(
                    request.context,
                    policy.version,
                    candidates.version(),
                    &err.to_string(),
                ));
            }
        };
        collaborators.inference.descriptor().assert_embedding_shape(&embedding)?;

        let liveness = match request.motion {
            Some(motion) => Some(
                liveness::hybrid_evaluate(
                    &motion,
                    request.crop.as_ref(),
                    collaborators.classifier,
                    &self.config.liveness,
                )
                .await,
            ),
            None => None,
        };

        let match_request = MatchRequest {
            live: embedding,
            liveness,
            secondary_score: request.secondary_score,
            context: request.context,
            policy_override: None,
            include_embedding: request.include_embedding,
        };
        self.match_and_decide(&match_request, candidates, policy)
    }
}
