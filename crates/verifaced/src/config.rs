use std::path::PathBuf;
use std::time::Duration;
use veriface_core::liveness::LivenessConfig;
use veriface_core::OrchestratorConfig;

/// Which message bus to register on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Some(Self::Session),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Persisted policy snapshot (JSON).
    pub policy_path: PathBuf,
    /// Candidate gallery (JSON array of candidates).
    pub gallery_path: PathBuf,
    /// Shortlist size for the fast scoring pass.
    pub shortlist_k: usize,
    /// Deadline for the ML liveness classifier.
    pub liveness_timeout_ms: u64,
    /// How long a loaded policy snapshot is trusted before re-reading.
    pub policy_ttl_secs: u64,
    /// Attach live embeddings to every package.
    pub include_embedding: bool,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("veriface");

        let policy_path = std::env::var("VERIFACE_POLICY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("policy.json"));
        let gallery_path = std::env::var("VERIFACE_GALLERY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.json"));

        let bus = match std::env::var("VERIFACE_BUS") {
            Ok(v) => BusKind::parse(&v).unwrap_or_else(|| {
                tracing::warn!(value = %v, "unknown VERIFACE_BUS; using session bus");
                BusKind::Session
            }),
            Err(_) => BusKind::Session,
        };

        Self {
            policy_path,
            gallery_path,
            shortlist_k: env_usize(
                "VERIFACE_SHORTLIST_K",
                veriface_core::matcher::DEFAULT_SHORTLIST_K,
            ),
            liveness_timeout_ms: env_u64(
                "VERIFACE_LIVENESS_TIMEOUT_MS",
                veriface_core::liveness::DEFAULT_CLASSIFIER_TIMEOUT_MS,
            ),
            policy_ttl_secs: env_u64("VERIFACE_POLICY_TTL_SECS", 30),
            include_embedding: std::env::var("VERIFACE_INCLUDE_EMBEDDING")
                .map(|v| v != "0")
                .unwrap_or(false),
            bus,
        }
    }

    pub fn policy_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_ttl_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            shortlist_k: self.shortlist_k,
            include_embedding: self.include_embedding,
            liveness: LivenessConfig {
                classifier_timeout_ms: self.liveness_timeout_ms,
                ..LivenessConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_kind_parse() {
        assert_eq!(BusKind::parse("system"), Some(BusKind::System));
        assert_eq!(BusKind::parse(" Session "), Some(BusKind::Session));
        assert_eq!(BusKind::parse("tcp"), None);
    }

    #[test]
    fn test_orchestrator_config_carries_overrides() {
        let config = Config {
            policy_path: PathBuf::from("/tmp/p.json"),
            gallery_path: PathBuf::from("/tmp/g.json"),
            shortlist_k: 3,
            liveness_timeout_ms: 250,
            policy_ttl_secs: 5,
            include_embedding: true,
            bus: BusKind::Session,
        };
        let oc = config.orchestrator_config();
        assert_eq!(oc.shortlist_k, 3);
        assert!(oc.include_embedding);
        assert_eq!(oc.liveness.classifier_timeout_ms, 250);
        assert_eq!(oc.shortlist_floor, 0.0);
        assert_eq!(config.policy_ttl(), Duration::from_secs(5));
    }
}
