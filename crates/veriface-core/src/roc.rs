//! Offline ROC analysis over labeled match scores, used to pick the
//! policy's operating thresholds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RocError {
    #[error("dataset is empty")]
    EmptyDataset,
    #[error("no thresholds given")]
    NoThresholds,
    #[error("threshold {0} is not a finite number")]
    InvalidThreshold(f32),
}

/// One historical comparison: its score and whether it was a genuine pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabeledScore {
    pub score: f32,
    pub genuine: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f32,
    pub tp: u64,
    pub fp: u64,
    pub tn: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub tpr: f32,
    pub fpr: f32,
    pub tnr: f32,
    pub fnr: f32,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub balanced_accuracy: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocReport {
    /// Sorted by ascending threshold.
    pub points: Vec<RocPoint>,
    pub best_f1: RocPoint,
    pub best_accuracy: RocPoint,
    pub best_balanced_accuracy: RocPoint,
    pub auc: f32,
    pub genuine_count: u64,
    pub impostor_count: u64,
}

fn ratio(num: u64, den: u64) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

fn point_at(dataset: &[LabeledScore], threshold: f32) -> RocPoint {
    let (mut tp, mut fp, mut tn, mut fn_) = (0u64, 0u64, 0u64, 0u64);
    for s in dataset {
        match (s.score >= threshold, s.genuine) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fn_ += 1,
        }
    }

    let tpr = ratio(tp, tp + fn_);
    let fpr = ratio(fp, fp + tn);
    let tnr = ratio(tn, tn + fp);
    let fnr = ratio(fn_, fn_ + tp);
    let precision = ratio(tp, tp + fp);
    let recall = tpr;
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    RocPoint {
        threshold,
        tp,
        fp,
        tn,
        fn_,
        tpr,
        fpr,
        tnr,
        fnr,
        accuracy: ratio(tp + tn, tp + fp + tn + fn_),
        precision,
        recall,
        f1,
        balanced_accuracy: (tpr + tnr) / 2.0,
    }
}

/// First point maximizing `metric`; ties keep the lowest threshold.
fn best_by(points: &[RocPoint], metric: impl Fn(&RocPoint) -> f32) -> RocPoint {
    let mut best = points[0];
    for p in &points[1..] {
        if metric(p) > metric(&best) {
            best = *p;
        }
    }
    best
}

/// Trapezoidal area under TPR(FPR), anchored at (0,0) and (1,1).
fn trapezoid_auc(points: &[RocPoint]) -> f32 {
    let mut curve: Vec<(f32, f32)> = points.iter().map(|p| (p.fpr, p.tpr)).collect();
    curve.push((0.0, 0.0));
    curve.push((1.0, 1.0));
    curve.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let area: f32 = curve
        .windows(2)
        .map(|w| (w[1].0 - w[0].0) * (w[0].1 + w[1].1) / 2.0)
        .sum();
    area.clamp(0.0, 1.0)
}

/// `steps` evenly spaced thresholds from `start` to `end` inclusive.
pub fn threshold_grid(start: f32, end: f32, steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        n => (0..n)
            .map(|i| start + (end - start) * i as f32 / (n - 1) as f32)
            .collect(),
    }
}

/// Sweep `thresholds` over the dataset, classifying `score >= threshold`
/// as a predicted genuine match.
pub fn generate_report(
    dataset: &[LabeledScore],
    thresholds: &[f32],
) -> Result<RocReport, RocError> {
    if dataset.is_empty() {
        return Err(RocError::EmptyDataset);
    }
    if let Some(&bad) = thresholds.iter().find(|t| !t.is_finite()) {
        return Err(RocError::InvalidThreshold(bad));
    }

    let mut sorted = thresholds.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    if sorted.is_empty() {
        return Err(RocError::NoThresholds);
    }

    let points: Vec<RocPoint> = sorted.iter().map(|&t| point_at(dataset, t)).collect();
    let genuine_count = dataset.iter().filter(|s| s.genuine).count() as u64;

    let report = RocReport {
        best_f1: best_by(&points, |p| p.f1),
        best_accuracy: best_by(&points, |p| p.accuracy),
        best_balanced_accuracy: best_by(&points, |p| p.balanced_accuracy),
        auc: trapezoid_auc(&points),
        genuine_count,
        impostor_count: dataset.len() as u64 - genuine_count,
        points,
    };

    tracing::info!(
        thresholds = report.points.len(),
        samples = dataset.len(),
        auc = report.auc,
        best_f1_threshold = report.best_f1.threshold,
        "ROC report generated"
    );
    Ok(report)
}

impl RocReport {
    /// Lowest threshold whose FPR is at most `target`, i.e. the most
    /// permissive operating point meeting a false-accept budget.
    pub fn find_threshold_for_target_fpr(&self, target: f32) -> Option<&RocPoint> {
        self.points.iter().find(|p| p.fpr <= target)
    }

    /// Highest threshold whose TPR is at least `target`, i.e. the strictest
    /// operating point that still accepts enough genuine users.
    pub fn find_threshold_for_target_tpr(&self, target: f32) -> Option<&RocPoint> {
        self.points.iter().rev().find(|p| p.tpr >= target)
    }
}
