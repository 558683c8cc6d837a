//! Vector math over embeddings: normalization, cosine similarity,
//! Euclidean distance and linear-scan candidate ranking.
//!
//! All functions are pure. Caller vectors are never mutated; normalization
//! always works on a copy.

use crate::types::{Candidate, MatchMethod, MatchResult, ScoredCandidate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Norms below this are treated as zero.
pub const NORM_EPSILON: f32 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error(
        "dimension mismatch: expected {expected}, got {actual} (embeddings from different models?)"
    )]
    DimensionMismatch { expected: usize, actual: usize },
}

fn check_dimensions(a: &[f32], b: &[f32]) -> Result<(), VectorError> {
    if a.len() != b.len() {
        return Err(VectorError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Return a unit-length copy of `v`.
///
/// A vector whose norm is below [`NORM_EPSILON`] is returned unchanged.
/// This never panics and never produces NaN.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize_in_place(&mut out);
    out
}

/// Normalize `v` in place and return its original norm.
///
/// Only used on buffers this crate owns (copies and cached references).
pub(crate) fn normalize_in_place(v: &mut [f32]) -> f32 {
    let norm = l2_norm(v);
    if norm < NORM_EPSILON {
        tracing::warn!(norm, dimension = v.len(), "zero-norm embedding; left unnormalized");
        return norm;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    norm
}

fn remap_unit(cos: f32) -> f32 {
    (cos.clamp(-1.0, 1.0) + 1.0) / 2.0
}

/// Cosine similarity between two vectors.
///
/// With `normalize = true` both sides are normalized (as copies) and the
/// raw [-1, 1] dot product is remapped to [0, 1]. With `normalize = false`
/// the full `dot / (|a| * |b|)` formula is returned in [-1, 1], and `0.0`
/// when either norm is near zero.
pub fn cosine_similarity(a: &[f32], b: &[f32], normalize: bool) -> Result<f32, VectorError> {
    check_dimensions(a, b)?;

    if normalize {
        let na = self::normalize(a);
        let nb = self::normalize(b);
        return Ok(remap_unit(dot(&na, &nb)));
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < NORM_EPSILON || norm_b < NORM_EPSILON {
        return Ok(0.0);
    }
    Ok((dot(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

/// Euclidean (L2) distance between two vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    check_dimensions(a, b)?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Compare two vectors with the given method.
///
/// Cosine scores are the remapped [0, 1] similarity of the normalized
/// vectors and carry the distance between the normalized vectors.
/// Euclidean scores are `1 / (1 + distance)` over the raw vectors.
pub fn compare(a: &[f32], b: &[f32], method: MatchMethod) -> Result<MatchResult, VectorError> {
    check_dimensions(a, b)?;
    match method {
        MatchMethod::Cosine => {
            let na = normalize(a);
            let nb = normalize(b);
            Ok(MatchResult {
                score: remap_unit(dot(&na, &nb)),
                distance: euclidean_distance(&na, &nb)?,
                method,
                normalized: true,
            })
        }
        MatchMethod::Euclidean => {
            let distance = euclidean_distance(a, b)?;
            Ok(MatchResult {
                score: 1.0 / (1.0 + distance),
                distance,
                method,
                normalized: false,
            })
        }
    }
}

/// Precomputed normalized form of a mostly-static reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEmbedding {
    normalized: Vec<f32>,
    original_norm: f32,
    dimension: usize,
}

impl CachedEmbedding {
    pub fn new(values: &[f32]) -> Self {
        let mut normalized = values.to_vec();
        let original_norm = normalize_in_place(&mut normalized);
        Self {
            dimension: normalized.len(),
            normalized,
            original_norm,
        }
    }

    pub fn normalized(&self) -> &[f32] {
        &self.normalized
    }

    pub fn original_norm(&self) -> f32 {
        self.original_norm
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Remapped cosine similarity against a cached reference.
///
/// Only the live side is normalized per call.
pub fn fast_cosine_similarity(live: &[f32], cached: &CachedEmbedding) -> Result<f32, VectorError> {
    if live.len() != cached.dimension {
        return Err(VectorError::DimensionMismatch {
            expected: cached.dimension,
            actual: live.len(),
        });
    }
    let live = normalize(live);
    Ok(remap_unit(dot(&live, &cached.normalized)))
}

/// Index and score of the highest score strictly above `threshold`.
/// Ties keep the first one seen. Non-finite scores are ignored.
pub(crate) fn select_best<I>(scores: I, threshold: f32) -> Option<(usize, f32)>
where
    I: IntoIterator<Item = (usize, f32)>,
{
    let mut best: Option<(usize, f32)> = None;
    for (idx, score) in scores {
        if !score.is_finite() || score <= threshold {
            continue;
        }
        match best {
            Some((_, s)) if score <= s => {}
            _ => best = Some((idx, score)),
        }
    }
    best
}

/// Up to `k` `(index, score)` pairs at or above `threshold`, best first.
/// The sort is stable so equal scores keep population order.
pub(crate) fn rank_top_k(scores: Vec<(usize, f32)>, k: usize, threshold: f32) -> Vec<(usize, f32)> {
    let mut kept: Vec<(usize, f32)> = scores
        .into_iter()
        .filter(|(_, s)| s.is_finite() && *s >= threshold)
        .collect();
    kept.sort_by(|a, b| b.1.total_cmp(&a.1));
    kept.truncate(k);
    kept
}

fn score_all(live: &[f32], candidates: &[Candidate]) -> Result<Vec<(usize, f32)>, VectorError> {
    let live = normalize(live);
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            check_dimensions(&live, &c.embedding.values)?;
            let reference = normalize(&c.embedding.values);
            Ok((i, remap_unit(dot(&live, &reference))))
        })
        .collect()
}

fn scored(candidates: &[Candidate], index: usize, score: f32, rank: usize) -> ScoredCandidate {
    ScoredCandidate {
        index,
        identity_id: candidates[index].identity_id.clone(),
        role: candidates[index].role.clone(),
        score,
        rank,
    }
}

/// Linear scan for the single best candidate whose score strictly exceeds
/// `threshold`. An empty population yields `None`.
pub fn find_best_match(
    live: &[f32],
    candidates: &[Candidate],
    threshold: f32,
) -> Result<Option<ScoredCandidate>, VectorError> {
    let scores = score_all(live, candidates)?;
    Ok(select_best(scores, threshold).map(|(i, s)| scored(candidates, i, s, 1)))
}

/// Up to `k` candidates at or above `threshold`, sorted by descending score
/// and ranked 1..=k.
pub fn find_top_k(
    live: &[f32],
    candidates: &[Candidate],
    k: usize,
    threshold: f32,
) -> Result<Vec<ScoredCandidate>, VectorError> {
    let scores = score_all(live, candidates)?;
    Ok(rank_top_k(scores, k, threshold)
        .into_iter()
        .enumerate()
        .map(|(pos, (i, s))| scored(candidates, i, s, pos + 1))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn candidate(id: &str, values: Vec<f32>) -> Candidate {
        Candidate {
            identity_id: id.into(),
            embedding: Embedding::new(values),
            role: None,
        }
    }

    #[test]
    fn test_normalize_unit_length() {
        let n = normalize(&[3.0, 4.0]);
        assert!((l2_norm(&n) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_unchanged() {
        let n = normalize(&[0.0, 0.0, 0.0]);
        assert_eq!(n, vec![0.0, 0.0, 0.0]);
        assert!(n.iter().all(|x| !x.is_nan()));
    }

    #[test]
    fn test_cosine_self_similarity() {
        let a = [0.3, -0.2, 0.9, 0.1];
        assert!((cosine_similarity(&a, &a, true).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        let x = [1.0, 0.0];
        let y = [0.0, 1.0];
        let neg = [-1.0, 0.0];
        assert!((cosine_similarity(&x, &y, true).unwrap() - 0.5).abs() < 1e-6);
        assert!(cosine_similarity(&x, &neg, true).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_does_not_mutate_inputs() {
        let a = vec![3.0, 4.0];
        let b = vec![4.0, 3.0];
        let _ = cosine_similarity(&a, &b, true).unwrap();
        assert_eq!(a, vec![3.0, 4.0]);
        assert_eq!(b, vec![4.0, 3.0]);
    }

    #[test]
    fn test_cosine_raw_formula() {
        let a = [1.0, 0.0];
        let b = [-2.0, 0.0];
        assert!((cosine_similarity(&a, &b, false).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_raw_zero_norm_returns_zero() {
        let a = [0.0, 0.0];
        let b = [1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b, false).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        let err = cosine_similarity(&[1.0], &[1.0, 2.0], true).unwrap_err();
        assert_eq!(err, VectorError::DimensionMismatch { expected: 1, actual: 2 });
    }

    #[test]
    fn test_euclidean_symmetric_and_zero_on_identity() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        let ab = euclidean_distance(&a, &b).unwrap();
        let ba = euclidean_distance(&b, &a).unwrap();
        assert!((ab - 5.0).abs() < 1e-6);
        assert_eq!(ab, ba);
        assert_eq!(euclidean_distance(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn test_compare_euclidean_score() {
        let r = compare(&[0.0, 0.0], &[3.0, 4.0], MatchMethod::Euclidean).unwrap();
        assert!((r.distance - 5.0).abs() < 1e-6);
        assert!((r.score - 1.0 / 6.0).abs() < 1e-6);
        assert!(!r.normalized);
    }

    #[test]
    fn test_compare_cosine_identical() {
        let r = compare(&[1.0, 1.0], &[2.0, 2.0], MatchMethod::Cosine).unwrap();
        assert!((r.score - 1.0).abs() < 1e-6);
        assert!(r.distance < 1e-6);
        assert!(r.normalized);
    }

    #[test]
    fn test_fast_cosine_matches_exact() {
        let live = [0.2, 0.7, -0.1];
        let reference = [0.3, 0.5, 0.2];
        let cached = CachedEmbedding::new(&reference);
        let fast = fast_cosine_similarity(&live, &cached).unwrap();
        let exact = cosine_similarity(&live, &reference, true).unwrap();
        assert!((fast - exact).abs() < 1e-6);
        assert!((cached.original_norm() - l2_norm(&reference)).abs() < 1e-6);
    }

    #[test]
    fn test_fast_cosine_dimension_mismatch() {
        let cached = CachedEmbedding::new(&[1.0, 0.0]);
        assert!(fast_cosine_similarity(&[1.0, 0.0, 0.0], &cached).is_err());
    }

    #[test]
    fn test_find_best_match_last_entry() {
        let pop = vec![
            candidate("a", vec![0.0, 1.0, 0.0]),
            candidate("b", vec![0.0, 0.0, 1.0]),
            candidate("c", vec![1.0, 0.0, 0.0]),
        ];
        let best = find_best_match(&[1.0, 0.0, 0.0], &pop, 0.6).unwrap().unwrap();
        assert_eq!(best.identity_id, "c");
        assert_eq!(best.index, 2);
    }

    #[test]
    fn test_find_best_match_threshold_is_strict() {
        let pop = vec![candidate("a", vec![0.0, 1.0])];
        // Orthogonal scores exactly 0.5.
        assert!(find_best_match(&[1.0, 0.0], &pop, 0.5).unwrap().is_none());
        assert!(find_best_match(&[1.0, 0.0], &pop, 0.49).unwrap().is_some());
    }

    #[test]
    fn test_find_best_match_tie_first_seen() {
        let pop = vec![
            candidate("first", vec![1.0, 0.0]),
            candidate("second", vec![2.0, 0.0]),
        ];
        let best = find_best_match(&[1.0, 0.0], &pop, 0.0).unwrap().unwrap();
        assert_eq!(best.identity_id, "first");
    }

    #[test]
    fn test_find_best_match_empty_population() {
        assert!(find_best_match(&[1.0], &[], 0.0).unwrap().is_none());
    }

    #[test]
    fn test_find_best_match_dimension_mismatch() {
        let pop = vec![candidate("a", vec![1.0, 0.0, 0.0])];
        assert!(find_best_match(&[1.0, 0.0], &pop, 0.0).is_err());
    }

    #[test]
    fn test_find_top_k_sorted_and_ranked() {
        let pop = vec![
            candidate("low", vec![0.0, 1.0]),
            candidate("high", vec![1.0, 0.0]),
            candidate("mid", vec![1.0, 1.0]),
            candidate("opposite", vec![-1.0, 0.0]),
        ];
        let top = find_top_k(&[1.0, 0.0], &pop, 2, 0.4).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].identity_id, "high");
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[1].identity_id, "mid");
        assert_eq!(top[1].rank, 2);
        assert!(top[0].score >= top[1].score);
    }

    #[test]
    fn test_find_top_k_threshold_inclusive() {
        let pop = vec![candidate("a", vec![0.0, 1.0])];
        let top = find_top_k(&[1.0, 0.0], &pop, 5, 0.5).unwrap();
        assert_eq!(top.len(), 1);
    }
}
