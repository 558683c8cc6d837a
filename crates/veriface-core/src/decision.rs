//! Decision engine: turns match, liveness and secondary-biometric scores
//! plus an effective policy into an auditable [`Decision`].
//!
//! Gates run in a fixed order and each appends exactly one audit entry:
//!
//! 1. `policy_validity`
//! 2. `liveness_gate`
//! 3. `similarity_gate`
//! 4. `secondary_combination`
//! 5. `ambiguity_gate`
//! 6. `confidence`
//!
//! After a terminal rejection the remaining status gates record `skipped`.
//! The engine is a pure function of its inputs.

use crate::policy::{CombinationMode, PolicyRules};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Accepted,
    Pending,
    Rejected,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Accepted => "accepted",
            DecisionStatus::Pending => "pending",
            DecisionStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    LowLiveness,
    NoCandidate,
    UncertainMatch,
    LowFaceScore,
    LowFingerprint,
    SecondaryRequired,
    MultipleCandidates,
    PolicyViolation,
    ProcessingError,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::LowLiveness => "low_liveness",
            DecisionReason::NoCandidate => "no_candidate",
            DecisionReason::UncertainMatch => "uncertain_match",
            DecisionReason::LowFaceScore => "low_face_score",
            DecisionReason::LowFingerprint => "low_fingerprint",
            DecisionReason::SecondaryRequired => "secondary_required",
            DecisionReason::MultipleCandidates => "multiple_candidates",
            DecisionReason::PolicyViolation => "policy_violation",
            DecisionReason::ProcessingError => "processing_error",
        }
    }

    /// End-user message. Never contains internal error text.
    pub fn message(&self) -> &'static str {
        match self {
            DecisionReason::LowLiveness => {
                "Liveness check failed. Please look at the camera and try again."
            }
            DecisionReason::NoCandidate => "Face not recognized.",
            DecisionReason::UncertainMatch => {
                "Identity could not be confirmed with enough confidence."
            }
            DecisionReason::LowFaceScore => "Face did not match. Please try again.",
            DecisionReason::LowFingerprint => "Fingerprint did not match.",
            DecisionReason::SecondaryRequired => "A second factor is required.",
            DecisionReason::MultipleCandidates => {
                "Several identities look similar. Manual review required."
            }
            DecisionReason::PolicyViolation => {
                "Verification is unavailable due to a configuration problem."
            }
            DecisionReason::ProcessingError => "Verification could not be completed.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    AskPin,
    RetryCapture,
    CaptureSecondary,
    RequireManualReview,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Proceed => "proceed",
            RecommendedAction::AskPin => "ask_pin",
            RecommendedAction::RetryCapture => "retry_capture",
            RecommendedAction::CaptureSecondary => "capture_secondary",
            RecommendedAction::RequireManualReview => "require_manual_review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    Passed,
    Failed,
    Uncertain,
    Applied,
    Skipped,
}

impl RuleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOutcome::Passed => "passed",
            RuleOutcome::Failed => "failed",
            RuleOutcome::Uncertain => "uncertain",
            RuleOutcome::Applied => "applied",
            RuleOutcome::Skipped => "skipped",
        }
    }
}

/// What a rule did to the decision status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleEffect {
    NoChange,
    SetStatus {
        status: DecisionStatus,
        reason: Option<DecisionReason>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub rule_name: String,
    pub condition: String,
    pub outcome: RuleOutcome,
    pub effect: RuleEffect,
}

/// Signal weights after renormalization over the signals present.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalWeights {
    #[serde(rename = "match")]
    pub match_weight: f32,
    pub liveness: f32,
    pub secondary: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub match_score: Option<f32>,
    pub liveness_score: Option<f32>,
    pub secondary_score: Option<f32>,
    pub weights: SignalWeights,
    pub final_confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub status: DecisionStatus,
    pub primary_reason: Option<DecisionReason>,
    pub recommended_action: RecommendedAction,
    /// Weighted signal confidence in [0, 100], independent of status.
    pub confidence: f32,
    pub message: String,
    pub score_breakdown: ScoreBreakdown,
    pub audit_trail: Vec<AuditEntry>,
}

impl Decision {
    /// A rejection for a request that could not be evaluated at all.
    pub fn fail_safe(
        reason: DecisionReason,
        rule_name: &str,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            status: DecisionStatus::Rejected,
            primary_reason: Some(reason),
            recommended_action: RecommendedAction::RetryCapture,
            confidence: 0.0,
            message: reason.message().to_string(),
            score_breakdown: ScoreBreakdown {
                match_score: None,
                liveness_score: None,
                secondary_score: None,
                weights: SignalWeights::default(),
                final_confidence: 0.0,
            },
            audit_trail: vec![AuditEntry {
                rule_name: rule_name.to_string(),
                condition: condition.into(),
                outcome: RuleOutcome::Failed,
                effect: RuleEffect::SetStatus {
                    status: DecisionStatus::Rejected,
                    reason: Some(reason),
                },
            }],
        }
    }

    /// The last status-setting effect in the audit trail.
    pub fn terminal_effect(&self) -> Option<(DecisionStatus, Option<DecisionReason>)> {
        self.audit_trail.iter().rev().find_map(|e| match e.effect {
            RuleEffect::SetStatus { status, reason } => Some((status, reason)),
            RuleEffect::NoChange => None,
        })
    }
}

/// Scores and counts the engine decides on.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DecisionInput {
    pub match_score: Option<f32>,
    pub liveness_score: Option<f32>,
    pub secondary_score: Option<f32>,
    pub candidate_count: usize,
}

struct Evaluation<'a> {
    rules: &'a PolicyRules,
    status: DecisionStatus,
    reason: Option<DecisionReason>,
    action: RecommendedAction,
    terminal: bool,
    trail: Vec<AuditEntry>,
}

impl<'a> Evaluation<'a> {
    fn new(rules: &'a PolicyRules) -> Self {
        Self {
            rules,
            status: DecisionStatus::Rejected,
            reason: None,
            action: RecommendedAction::RetryCapture,
            terminal: false,
            trail: Vec::with_capacity(6),
        }
    }

    fn note(&mut self, rule: &str, condition: String, outcome: RuleOutcome) {
        self.trail.push(AuditEntry {
            rule_name: rule.to_string(),
            condition,
            outcome,
            effect: RuleEffect::NoChange,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn set(
        &mut self,
        rule: &str,
        condition: String,
        outcome: RuleOutcome,
        status: DecisionStatus,
        reason: Option<DecisionReason>,
        action: RecommendedAction,
        terminal: bool,
    ) {
        self.status = status;
        self.reason = reason;
        self.action = action;
        self.terminal |= terminal;
        self.trail.push(AuditEntry {
            rule_name: rule.to_string(),
            condition,
            outcome,
            effect: RuleEffect::SetStatus { status, reason },
        });
    }

    /// Record a skip when an earlier gate already rejected terminally.
    fn skip_if_terminal(&mut self, rule: &str) -> bool {
        if self.terminal {
            let why = format!(
                "not evaluated: already rejected ({})",
                self.reason.map_or("unknown", |r| r.as_str())
            );
            self.note(rule, why, RuleOutcome::Skipped);
        }
        self.terminal
    }

    fn policy_validity(&mut self) {
        match self.rules.validate() {
            Ok(()) => self.note(
                "policy_validity",
                "effective policy satisfies invariants".into(),
                RuleOutcome::Passed,
            ),
            Err(err) => {
                tracing::warn!(error = %err, "effective policy invalid; rejecting");
                self.set(
                    "policy_validity",
                    err.to_string(),
                    RuleOutcome::Failed,
                    DecisionStatus::Rejected,
                    Some(DecisionReason::PolicyViolation),
                    RecommendedAction::RequireManualReview,
                    true,
                );
            }
        }
    }

    fn liveness_gate(&mut self, liveness: Option<f32>) {
        const RULE: &str = "liveness_gate";
        if self.skip_if_terminal(RULE) {
            return;
        }
        let min = self.rules.liveness_min;
        match liveness {
            None if self.rules.require_liveness => self.set(
                RULE,
                "liveness required but not supplied".into(),
                RuleOutcome::Failed,
                DecisionStatus::Rejected,
                Some(DecisionReason::LowLiveness),
                RecommendedAction::RetryCapture,
                true,
            ),
            None => self.note(
                RULE,
                "liveness not required and not supplied".into(),
                RuleOutcome::Passed,
            ),
            Some(score) if score < min => self.set(
                RULE,
                format!("liveness {score:.4} < liveness_min {min:.4}"),
                RuleOutcome::Failed,
                DecisionStatus::Rejected,
                Some(DecisionReason::LowLiveness),
                RecommendedAction::RetryCapture,
                true,
            ),
            Some(score) => self.note(
                RULE,
                format!("liveness {score:.4} >= liveness_min {min:.4}"),
                RuleOutcome::Passed,
            ),
        }
    }

    fn similarity_gate(&mut self, match_score: Option<f32>, candidate_count: usize) {
        const RULE: &str = "similarity_gate";
        if self.skip_if_terminal(RULE) {
            return;
        }
        let accept = self.rules.global_match_threshold;
        let uncertain = self.rules.uncertain_threshold;

        let score = match match_score {
            Some(s) if candidate_count > 0 => s,
            _ => {
                self.set(
                    RULE,
                    format!("no match score (candidates = {candidate_count})"),
                    RuleOutcome::Failed,
                    DecisionStatus::Rejected,
                    Some(DecisionReason::NoCandidate),
                    RecommendedAction::RetryCapture,
                    true,
                );
                return;
            }
        };

        if score >= accept {
            self.set(
                RULE,
                format!("match {score:.4} >= global_match_threshold {accept:.4}"),
                RuleOutcome::Passed,
                DecisionStatus::Accepted,
                None,
                RecommendedAction::Proceed,
                false,
            );
        } else if score >= uncertain {
            let action = if self.rules.allow_uncertain_fallback {
                RecommendedAction::AskPin
            } else {
                RecommendedAction::RequireManualReview
            };
            self.set(
                RULE,
                format!(
                    "uncertain_threshold {uncertain:.4} <= match {score:.4} \
                     < global_match_threshold {accept:.4}"
                ),
                RuleOutcome::Uncertain,
                DecisionStatus::Pending,
                Some(DecisionReason::UncertainMatch),
                action,
                false,
            );
        } else {
            self.set(
                RULE,
                format!("match {score:.4} < uncertain_threshold {uncertain:.4}"),
                RuleOutcome::Failed,
                DecisionStatus::Rejected,
                Some(DecisionReason::LowFaceScore),
                RecommendedAction::RetryCapture,
                false,
            );
        }
    }

    fn secondary_combination(&mut self, secondary: Option<f32>) {
        const RULE: &str = "secondary_combination";
        if self.skip_if_terminal(RULE) {
            return;
        }
        let threshold = self.rules.secondary_threshold;

        match self.rules.combination_mode {
            CombinationMode::RequireBoth => match secondary {
                Some(s) if s < threshold => self.set(
                    RULE,
                    format!("require_both: secondary {s:.4} < secondary_threshold {threshold:.4}"),
                    RuleOutcome::Failed,
                    DecisionStatus::Rejected,
                    Some(DecisionReason::LowFingerprint),
                    RecommendedAction::RetryCapture,
                    true,
                ),
                Some(s) => self.note(
                    RULE,
                    format!("require_both: secondary {s:.4} >= secondary_threshold {threshold:.4}"),
                    RuleOutcome::Passed,
                ),
                None if self.status == DecisionStatus::Accepted => self.set(
                    RULE,
                    "require_both: secondary missing".into(),
                    RuleOutcome::Failed,
                    DecisionStatus::Pending,
                    Some(DecisionReason::SecondaryRequired),
                    RecommendedAction::CaptureSecondary,
                    false,
                ),
                None => self.note(
                    RULE,
                    format!(
                        "require_both: secondary missing; status already {}",
                        self.status.as_str()
                    ),
                    RuleOutcome::Failed,
                ),
            },
            CombinationMode::RequireEither => {
                if self.status == DecisionStatus::Accepted {
                    self.note(
                        RULE,
                        "require_either: face match sufficient".into(),
                        RuleOutcome::Passed,
                    );
                    return;
                }
                match secondary {
                    Some(s) if s >= threshold => self.set(
                        RULE,
                        format!(
                            "require_either: secondary {s:.4} \
                             >= secondary_threshold {threshold:.4} (fallback)"
                        ),
                        RuleOutcome::Applied,
                        DecisionStatus::Accepted,
                        None,
                        RecommendedAction::Proceed,
                        false,
                    ),
                    Some(s) => self.note(
                        RULE,
                        format!(
                            "require_either: secondary {s:.4} < secondary_threshold {threshold:.4}"
                        ),
                        RuleOutcome::Failed,
                    ),
                    None => self.note(
                        RULE,
                        "require_either: no secondary to fall back on".into(),
                        RuleOutcome::Failed,
                    ),
                }
            }
            CombinationMode::AllowFallbackPin => {
                let pin_eligible = self.status == DecisionStatus::Pending
                    || self.reason == Some(DecisionReason::LowFaceScore);
                if pin_eligible {
                    self.action = RecommendedAction::AskPin;
                    self.note(
                        RULE,
                        "allow_fallback_pin: recommend PIN fallback".into(),
                        RuleOutcome::Applied,
                    );
                } else {
                    self.note(
                        RULE,
                        "allow_fallback_pin: no fallback needed".into(),
                        RuleOutcome::Passed,
                    );
                }
            }
        }
    }

    fn ambiguity_gate(&mut self, candidate_count: usize) {
        const RULE: &str = "ambiguity_gate";
        if self.skip_if_terminal(RULE) {
            return;
        }
        let max = self.rules.max_candidates;
        if candidate_count > max {
            self.set(
                RULE,
                format!("candidates {candidate_count} > max_candidates {max}"),
                RuleOutcome::Failed,
                DecisionStatus::Rejected,
                Some(DecisionReason::MultipleCandidates),
                RecommendedAction::RequireManualReview,
                true,
            );
        } else {
            self.note(
                RULE,
                format!("candidates {candidate_count} <= max_candidates {max}"),
                RuleOutcome::Passed,
            );
        }
    }

    fn confidence(&mut self, input: &DecisionInput) -> ScoreBreakdown {
        let rules = self.rules;
        let pick = |score: Option<f32>, weight: f32| {
            score.map(|s| (s.clamp(0.0, 1.0), weight.max(0.0)))
        };
        let signals = [
            pick(input.match_score, rules.match_weight),
            pick(input.liveness_score, rules.liveness_weight),
            pick(input.secondary_score, rules.secondary_weight),
        ];

        let total: f32 = signals.iter().flatten().map(|(_, w)| w).sum();
        let (weights, final_confidence) = if total > 0.0 && total.is_finite() {
            let norm = |sig: Option<(f32, f32)>| sig.map_or(0.0, |(_, w)| w / total);
            let weighted: f32 = signals.iter().flatten().map(|(s, w)| s * w).sum();
            (
                SignalWeights {
                    match_weight: norm(signals[0]),
                    liveness: norm(signals[1]),
                    secondary: norm(signals[2]),
                },
                (weighted / total * 100.0).clamp(0.0, 100.0),
            )
        } else {
            (SignalWeights::default(), 0.0)
        };

        let present = signals.iter().flatten().count();
        self.note(
            "confidence",
            format!("{present} signal(s) weighted; confidence {final_confidence:.2}"),
            RuleOutcome::Applied,
        );

        ScoreBreakdown {
            match_score: input.match_score,
            liveness_score: input.liveness_score,
            secondary_score: input.secondary_score,
            weights,
            final_confidence,
        }
    }
}

fn finite_or_absent(name: &str, score: Option<f32>) -> Option<f32> {
    match score {
        Some(s) if !s.is_finite() => {
            tracing::warn!(signal = name, "non-finite score treated as absent");
            None
        }
        other => other,
    }
}

/// Evaluate one request against an effective rule set.
pub fn decide(input: &DecisionInput, rules: &PolicyRules) -> Decision {
    let input = DecisionInput {
        match_score: finite_or_absent("match", input.match_score),
        liveness_score: finite_or_absent("liveness", input.liveness_score),
        secondary_score: finite_or_absent("secondary", input.secondary_score),
        candidate_count: input.candidate_count,
    };

    let mut eval = Evaluation::new(rules);
    eval.policy_validity();
    eval.liveness_gate(input.liveness_score);
    eval.similarity_gate(input.match_score, input.candidate_count);
    eval.secondary_combination(input.secondary_score);
    eval.ambiguity_gate(input.candidate_count);
    let breakdown = eval.confidence(&input);

    let message = match eval.reason {
        Some(reason) => reason.message().to_string(),
        None => "Identity verified.".to_string(),
    };

    tracing::debug!(
        status = eval.status.as_str(),
        reason = eval.reason.map(|r| r.as_str()),
        confidence = breakdown.final_confidence,
        "decision evaluated"
    );

    Decision {
        status: eval.status,
        primary_reason: eval.reason,
        recommended_action: eval.action,
        confidence: breakdown.final_confidence,
        message,
        score_breakdown: breakdown,
        audit_trail: eval.trail,
    }
}
