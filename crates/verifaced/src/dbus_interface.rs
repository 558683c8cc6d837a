use crate::engine::{EngineHandle, GalleryReloader};
use std::path::PathBuf;
use std::sync::Arc;
use veriface_core::{merge_overrides, FilePersistence, MatchRequest, PolicyStore};
use zbus::interface;

pub const BUS_NAME: &str = "org.veriface.Decision1";
pub const OBJECT_PATH: &str = "/org/veriface/Decision1";

/// D-Bus interface for the Veriface decision daemon.
///
/// Bus name: org.veriface.Decision1
/// Object path: /org/veriface/Decision1
pub struct DecisionService {
    engine: EngineHandle,
    store: Arc<PolicyStore<FilePersistence>>,
    gallery: GalleryReloader,
}

impl DecisionService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<PolicyStore<FilePersistence>>,
        gallery_path: PathBuf,
        gallery_version: u64,
    ) -> Self {
        Self {
            engine,
            store,
            gallery: GalleryReloader::new(gallery_path, gallery_version),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn failed(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

#[interface(name = "org.veriface.Decision1")]
impl DecisionService {
    /// Match one live embedding and return the decision package as JSON.
    async fn match_and_decide(&self, request_json: &str) -> zbus::fdo::Result<String> {
        let request: MatchRequest = serde_json::from_str(request_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad match request: {e}")))?;
        tracing::info!(device = %request.context.device_id, "match_and_decide requested");
        let package = self.engine.decide(request).await.map_err(failed)?;
        to_json(&package)
    }

    /// Match a JSON array of requests; the reply has one package per request, in order.
    async fn batch_match_and_decide(&self, requests_json: &str) -> zbus::fdo::Result<String> {
        let requests: Vec<MatchRequest> = serde_json::from_str(requests_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad batch request: {e}")))?;
        tracing::info!(count = requests.len(), "batch_match_and_decide requested");
        let packages = self.engine.decide_batch(requests).await.map_err(failed)?;
        to_json(&packages)
    }

    /// Re-read the persisted policy now. Returns the active policy version.
    async fn reload_policy(&self) -> zbus::fdo::Result<u64> {
        let policy = self.store.force_refresh().map_err(failed)?;
        tracing::info!(version = policy.version, "policy reloaded");
        Ok(policy.version)
    }

    /// Re-read the gallery file and swap the candidate set. Returns the candidate count.
    async fn reload_candidates(&self) -> zbus::fdo::Result<u32> {
        let stats = self.gallery.reload(&self.engine).await.map_err(failed)?;
        Ok(u32::try_from(stats.candidates).unwrap_or(u32::MAX))
    }

    /// Effective policy for a role and identity. Empty strings mean none.
    async fn effective_policy(&self, role: &str, identity: &str) -> zbus::fdo::Result<String> {
        let policy = self.store.snapshot();
        to_json(&merge_overrides(&policy, non_empty(role), non_empty(identity)))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let stats = self.engine.stats().await.map_err(failed)?;
        let policy = self.store.snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "policy_version": policy.version,
            "policy_initialized": self.store.is_initialized(),
            "candidate_set_version": stats.candidate_set_version,
            "candidates": stats.candidates,
            "dimension": stats.dimension,
            "decisions": stats.decisions,
        })
        .to_string())
    }
}
