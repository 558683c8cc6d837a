//! veriface-core: face embedding matching and access policy decisions.
//!
//! Takes live embeddings from an external inference service, ranks them
//! against a pre-cached candidate gallery, and runs the result through a
//! versioned policy to produce an auditable decision package.

pub mod collab;
pub mod decision;
pub mod liveness;
pub mod matcher;
pub mod policy;
pub mod quantize;
pub mod roc;
pub mod store;
pub mod transport;
pub mod types;
pub mod vector;

pub use decision::{
    decide, Decision, DecisionInput, DecisionReason, DecisionStatus, RecommendedAction,
};
pub use matcher::{
    pre_cache, CandidateSet, DecisionPackage, MatchContext, MatchRequest, Orchestrator,
    OrchestratorConfig,
};
pub use policy::{merge_overrides, EffectivePolicy, Policy, PolicyRules};
pub use store::{FilePersistence, PolicyStore};
pub use types::{Candidate, Embedding, MatchMethod, MatchResult, ScoredCandidate};
