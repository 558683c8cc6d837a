use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use veriface_core::matcher::MatchError;
use veriface_core::store::{PolicyPersistence, PolicyStore};
use veriface_core::vector::VectorError;
use veriface_core::{
    pre_cache, Candidate, CandidateSet, DecisionPackage, MatchRequest, Orchestrator, Policy,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gallery I/O: {0}")]
    GalleryIo(#[from] std::io::Error),
    #[error("gallery parse: {0}")]
    GalleryParse(#[from] serde_json::Error),
    #[error("gallery: {0}")]
    Gallery(#[from] VectorError),
    #[error("match failed: {0}")]
    Match(#[from] MatchError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of what the engine is currently matching against.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    pub candidate_set_version: u64,
    pub candidates: usize,
    pub dimension: Option<usize>,
    pub decisions: u64,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Decide {
        request: Box<MatchRequest>,
        reply: oneshot::Sender<Result<DecisionPackage, EngineError>>,
    },
    DecideBatch {
        requests: Vec<MatchRequest>,
        reply: oneshot::Sender<Vec<DecisionPackage>>,
    },
    ReplaceCandidates {
        candidates: CandidateSet,
        reply: oneshot::Sender<EngineStats>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Match one request against the current candidate set and policy.
    pub async fn decide(&self, request: MatchRequest) -> Result<DecisionPackage, EngineError> {
        self.call(|reply| EngineRequest::Decide {
            request: Box::new(request),
            reply,
        })
        .await?
    }

    /// Match a batch in order; failing items come back as fail-safe rejections.
    pub async fn decide_batch(
        &self,
        requests: Vec<MatchRequest>,
    ) -> Result<Vec<DecisionPackage>, EngineError> {
        self.call(|reply| EngineRequest::DecideBatch { requests, reply })
            .await
    }

    /// Swap in a new candidate population. In-flight requests finish
    /// against the set they started with.
    pub async fn replace_candidates(
        &self,
        candidates: CandidateSet,
    ) -> Result<EngineStats, EngineError> {
        self.call(|reply| EngineRequest::ReplaceCandidates { candidates, reply })
            .await
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.call(|reply| EngineRequest::Stats { reply }).await
    }
}

/// Read a gallery file (JSON array of candidates) and pre-cache it.
///
/// A missing file yields an empty population.
pub fn load_gallery(path: &Path, version: u64) -> Result<CandidateSet, EngineError> {
    let candidates: Vec<Candidate> = match std::fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %path.display(),
                "gallery file not found; starting with no candidates"
            );
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(pre_cache(candidates, version)?)
}

/// Reloads the gallery file into the engine under a monotonic version.
///
/// Reloads are serialized; the version only advances once the engine has
/// accepted the new set, so a failed load leaves no gap.
pub struct GalleryReloader {
    path: PathBuf,
    version: tokio::sync::Mutex<u64>,
}

impl GalleryReloader {
    pub fn new(path: PathBuf, installed_version: u64) -> Self {
        Self {
            path,
            version: tokio::sync::Mutex::new(installed_version),
        }
    }

    pub async fn reload(&self, engine: &EngineHandle) -> Result<EngineStats, EngineError> {
        let mut version = self.version.lock().await;
        let next = *version + 1;
        let set = load_gallery(&self.path, next)?;
        let stats = engine.replace_candidates(set).await?;
        *version = next;
        Ok(stats)
    }
}

fn current_policy<P: PolicyPersistence>(store: &PolicyStore<P>) -> Arc<Policy> {
    store.refresh().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "policy refresh failed; using current snapshot");
        store.snapshot()
    })
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the orchestrator and the current candidate set, and
/// takes a policy snapshot from the store at the start of every request.
pub fn spawn_engine<P>(
    orchestrator: Orchestrator,
    candidates: CandidateSet,
    store: Arc<PolicyStore<P>>,
) -> Result<EngineHandle, EngineError>
where
    P: PolicyPersistence + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("veriface-engine".into())
        .spawn(move || {
            tracing::info!(
                candidate_set_version = candidates.version(),
                candidates = candidates.len(),
                "engine thread started"
            );
            let mut candidates = Arc::new(candidates);
            let mut decisions = 0u64;
            let stats = |c: &CandidateSet, decisions: u64| EngineStats {
                candidate_set_version: c.version(),
                candidates: c.len(),
                dimension: c.dimension(),
                decisions,
            };

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Decide { request, reply } => {
                        let policy = current_policy(&store);
                        let result = orchestrator
                            .match_and_decide(&request, &candidates, &policy)
                            .map_err(EngineError::from);
                        if let Err(err) = &result {
                            tracing::warn!(
                                error = %err,
                                device = %request.context.device_id,
                                "decide failed"
                            );
                        }
                        decisions += 1;
                        let _ = reply.send(result);
                    }
                    EngineRequest::DecideBatch { requests, reply } => {
                        let policy = current_policy(&store);
                        let packages =
                            orchestrator.batch_match_and_decide(&requests, &candidates, &policy);
                        decisions += packages.len() as u64;
                        let _ = reply.send(packages);
                    }
                    EngineRequest::ReplaceCandidates {
                        candidates: next,
                        reply,
                    } => {
                        tracing::info!(
                            from = candidates.version(),
                            to = next.version(),
                            count = next.len(),
                            "candidate set replaced"
                        );
                        candidates = Arc::new(next);
                        let _ = reply.send(stats(&candidates, decisions));
                    }
                    EngineRequest::Stats { reply } => {
                        let _ = reply.send(stats(&candidates, decisions));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use veriface_core::liveness::LivenessResult;
    use veriface_core::store::MemoryPersistence;
    use veriface_core::{DecisionStatus, Embedding, MatchContext, OrchestratorConfig};

    fn candidate(id: &str, values: Vec<f32>) -> Candidate {
        Candidate {
            identity_id: id.into(),
            embedding: Embedding::new(values),
            role: None,
        }
    }

    fn request(values: Vec<f32>) -> MatchRequest {
        MatchRequest {
            live: Embedding::new(values),
            liveness: Some(LivenessResult::from_score(0.95)),
            secondary_score: None,
            context: MatchContext {
                device_id: "door-1".into(),
                location: None,
                timestamp: chrono::Utc::now(),
            },
            policy_override: None,
            include_embedding: false,
        }
    }

    fn engine(candidates: Vec<Candidate>) -> EngineHandle {
        let store = Arc::new(PolicyStore::new(MemoryPersistence::new(), Duration::from_secs(60)));
        store.initialize().unwrap();
        let set = pre_cache(candidates, 1).unwrap();
        spawn_engine(Orchestrator::new(OrchestratorConfig::default()), set, store).unwrap()
    }

    #[tokio::test]
    async fn test_decide_through_engine() {
        let handle = engine(vec![candidate("alice", vec![1.0, 0.0, 0.0])]);
        let package = handle.decide(request(vec![1.0, 0.0, 0.0])).await.unwrap();
        assert_eq!(package.identity_id.as_deref(), Some("alice"));
        assert_eq!(package.decision.status, DecisionStatus::Accepted);
        assert_eq!(handle.stats().await.unwrap().decisions, 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_error() {
        let handle = engine(vec![candidate("alice", vec![1.0, 0.0, 0.0])]);
        let err = handle.decide(request(vec![1.0, 0.0])).await.unwrap_err();
        assert!(matches!(err, EngineError::Match(_)));
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_fails_safe() {
        let handle = engine(vec![candidate("alice", vec![1.0, 0.0, 0.0])]);
        let packages = handle
            .decide_batch(vec![request(vec![1.0, 0.0, 0.0]), request(vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].decision.status, DecisionStatus::Accepted);
        assert_eq!(packages[1].decision.status, DecisionStatus::Rejected);
    }

    #[tokio::test]
    async fn test_replace_candidates() {
        let handle = engine(vec![candidate("alice", vec![1.0, 0.0, 0.0])]);
        let next = pre_cache(
            vec![
                candidate("bob", vec![0.0, 1.0, 0.0]),
                candidate("carol", vec![0.0, 0.0, 1.0]),
            ],
            2,
        )
        .unwrap();
        let stats = handle.replace_candidates(next).await.unwrap();
        assert_eq!(stats.candidate_set_version, 2);
        assert_eq!(stats.candidates, 2);

        let package = handle.decide(request(vec![0.0, 1.0, 0.0])).await.unwrap();
        assert_eq!(package.identity_id.as_deref(), Some("bob"));
        assert_eq!(package.candidate_set_version, 2);
    }

    fn temp_gallery(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("veriface-{name}-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_failed_reload_does_not_advance_version() {
        let handle = engine(vec![candidate("alice", vec![1.0, 0.0, 0.0])]);
        let path = temp_gallery("reload");
        std::fs::write(&path, "not json").unwrap();
        let reloader = GalleryReloader::new(path.clone(), 1);

        assert!(matches!(
            reloader.reload(&handle).await,
            Err(EngineError::GalleryParse(_))
        ));
        assert_eq!(handle.stats().await.unwrap().candidate_set_version, 1);

        let gallery = vec![candidate("bob", vec![0.0, 1.0, 0.0])];
        std::fs::write(&path, serde_json::to_string(&gallery).unwrap()).unwrap();
        let stats = reloader.reload(&handle).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(stats.candidate_set_version, 2);
        assert_eq!(stats.candidates, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reloads_install_in_order() {
        let handle = engine(vec![candidate("alice", vec![1.0, 0.0, 0.0])]);
        let path = temp_gallery("reload-race");
        let gallery = vec![candidate("bob", vec![0.0, 1.0, 0.0])];
        std::fs::write(&path, serde_json::to_string(&gallery).unwrap()).unwrap();
        let reloader = Arc::new(GalleryReloader::new(path.clone(), 1));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let reloader = Arc::clone(&reloader);
                let handle = handle.clone();
                tokio::spawn(async move { reloader.reload(&handle).await.unwrap() })
            })
            .collect();
        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap().candidate_set_version);
        }
        std::fs::remove_file(&path).unwrap();

        versions.sort_unstable();
        assert_eq!(versions, vec![2, 3, 4, 5]);
        assert_eq!(handle.stats().await.unwrap().candidate_set_version, 5);
    }

    #[test]
    fn test_load_gallery_missing_file_is_empty() {
        let path = temp_gallery("missing");
        let set = load_gallery(&path, 7).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.version(), 7);
    }

    #[test]
    fn test_load_gallery_from_file() {
        let path = temp_gallery("gallery");
        let gallery = vec![candidate("alice", vec![3.0, 4.0]), candidate("bob", vec![0.0, 2.0])];
        std::fs::write(&path, serde_json::to_string(&gallery).unwrap()).unwrap();
        let set = load_gallery(&path, 1).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.dimension(), Some(2));
    }
}
