//! Versioned decision policy with base → role → identity overrides.
//!
//! A [`Policy`] is an immutable snapshot. [`merge_overrides`] resolves the
//! effective rules for one request; the layer order is fixed and identity
//! overrides always win.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// Shipped baseline.
pub const DEFAULT_GLOBAL_MATCH_THRESHOLD: f32 = 0.55;
pub const DEFAULT_UNCERTAIN_THRESHOLD: f32 = 0.40;
pub const DEFAULT_LIVENESS_MIN: f32 = 0.70;
pub const DEFAULT_SECONDARY_THRESHOLD: f32 = 0.70;
pub const DEFAULT_MATCH_WEIGHT: f32 = 0.60;
pub const DEFAULT_LIVENESS_WEIGHT: f32 = 0.25;
pub const DEFAULT_SECONDARY_WEIGHT: f32 = 0.15;
pub const DEFAULT_MAX_CANDIDATES: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("policy violation: {0}")]
    Violation(String),
    #[error("policy parse error: {0}")]
    Parse(String),
}

/// How a secondary biometric (e.g. fingerprint) combines with the face match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationMode {
    /// Secondary must be present and pass.
    RequireBoth,
    /// A passing secondary can rescue a non-accepted face match.
    #[default]
    RequireEither,
    /// Status is untouched; uncertain or low-score outcomes suggest a PIN.
    AllowFallbackPin,
}

/// The scalar rule set the decision engine evaluates against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    pub global_match_threshold: f32,
    pub uncertain_threshold: f32,
    pub liveness_min: f32,
    pub secondary_threshold: f32,
    pub match_weight: f32,
    pub liveness_weight: f32,
    pub secondary_weight: f32,
    pub combination_mode: CombinationMode,
    pub require_liveness: bool,
    pub allow_uncertain_fallback: bool,
    pub max_candidates: usize,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            global_match_threshold: DEFAULT_GLOBAL_MATCH_THRESHOLD,
            uncertain_threshold: DEFAULT_UNCERTAIN_THRESHOLD,
            liveness_min: DEFAULT_LIVENESS_MIN,
            secondary_threshold: DEFAULT_SECONDARY_THRESHOLD,
            match_weight: DEFAULT_MATCH_WEIGHT,
            liveness_weight: DEFAULT_LIVENESS_WEIGHT,
            secondary_weight: DEFAULT_SECONDARY_WEIGHT,
            combination_mode: CombinationMode::default(),
            require_liveness: true,
            allow_uncertain_fallback: true,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

fn check_unit(name: &str, value: f32) -> Result<(), PolicyError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(PolicyError::Violation(format!("{name} = {value} is outside [0, 1]")));
    }
    Ok(())
}

fn check_weight(name: &str, value: f32) -> Result<(), PolicyError> {
    if !value.is_finite() || value < 0.0 {
        return Err(PolicyError::Violation(format!(
            "{name} = {value} must be a non-negative number"
        )));
    }
    Ok(())
}

impl PolicyRules {
    /// Check the invariants a merged rule set must satisfy.
    pub fn validate(&self) -> Result<(), PolicyError> {
        check_unit("global_match_threshold", self.global_match_threshold)?;
        check_unit("uncertain_threshold", self.uncertain_threshold)?;
        check_unit("liveness_min", self.liveness_min)?;
        check_unit("secondary_threshold", self.secondary_threshold)?;
        check_weight("match_weight", self.match_weight)?;
        check_weight("liveness_weight", self.liveness_weight)?;
        check_weight("secondary_weight", self.secondary_weight)?;
        if self.uncertain_threshold > self.global_match_threshold {
            return Err(PolicyError::Violation(format!(
                "uncertain_threshold {} exceeds global_match_threshold {}",
                self.uncertain_threshold, self.global_match_threshold
            )));
        }
        Ok(())
    }
}

/// A partial rule set. Only the fields that are `Some` replace the layer below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_match_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncertain_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_min: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combination_mode: Option<CombinationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_liveness: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_uncertain_fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_candidates: Option<usize>,
}

impl PolicyOverride {
    pub fn apply_to(&self, rules: &mut PolicyRules) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field {
                    rules.$field = v;
                })*
            };
        }
        overlay!(
            global_match_threshold,
            uncertain_threshold,
            liveness_min,
            secondary_threshold,
            match_weight,
            liveness_weight,
            secondary_weight,
            combination_mode,
            require_liveness,
            allow_uncertain_fallback,
            max_candidates,
        );
    }
}

/// A complete policy snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub rules: PolicyRules,
    #[serde(default)]
    pub role_overrides: BTreeMap<String, PolicyOverride>,
    #[serde(default)]
    pub identity_overrides: BTreeMap<String, PolicyOverride>,
}

impl Policy {
    pub fn from_toml_str(s: &str) -> Result<Self, PolicyError> {
        toml::from_str(s).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, PolicyError> {
        toml::to_string_pretty(self).map_err(|e| PolicyError::Parse(e.to_string()))
    }
}

/// Rules resolved for one request, with the layers that contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub version: u64,
    pub rules: PolicyRules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_applied: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_applied: Option<String>,
}

/// Resolve the effective rules: base, then the role override, then the
/// identity override. The result is not validated here; the decision
/// engine reports invalid rules as a policy violation.
pub fn merge_overrides(
    policy: &Policy,
    role: Option<&str>,
    identity_id: Option<&str>,
) -> EffectivePolicy {
    let mut rules = policy.rules.clone();

    let role_applied = role.and_then(|r| {
        policy.role_overrides.get(r).map(|o| {
            o.apply_to(&mut rules);
            r.to_string()
        })
    });
    let identity_applied = identity_id.and_then(|id| {
        policy.identity_overrides.get(id).map(|o| {
            o.apply_to(&mut rules);
            id.to_string()
        })
    });

    EffectivePolicy {
        version: policy.version,
        rules,
        role_applied,
        identity_applied,
    }
}
