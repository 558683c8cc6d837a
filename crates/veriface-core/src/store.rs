//! Policy store: one explicitly constructed cache of the current policy
//! snapshot per process, backed by a pluggable persistence collaborator.
//!
//! Lifecycle is `new` → `initialize` → `snapshot` / `refresh` / `update`.
//! Snapshots are `Arc<Policy>`; replacing the current snapshot never
//! affects a decision already holding the previous one.

use crate::policy::{Policy, PolicyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("policy store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("policy store serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("policy store used before initialize()")]
    NotInitialized,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// A persisted policy with its last-write timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPolicy {
    pub policy: Policy,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for the policy. Consistency is the implementor's concern.
pub trait PolicyPersistence: Send + Sync {
    fn load(&self) -> Result<Option<StoredPolicy>, StoreError>;
    fn save(&self, stored: &StoredPolicy) -> Result<(), StoreError>;
}

/// JSON file persistence. Writes go to a sibling temp file first and are
/// renamed into place.
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl PolicyPersistence for FilePersistence {
    fn load(&self) -> Result<Option<StoredPolicy>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, stored: &StoredPolicy) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(stored)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process persistence.
#[derive(Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<StoredPolicy>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(stored: StoredPolicy) -> Self {
        Self {
            slot: Mutex::new(Some(stored)),
        }
    }
}

impl PolicyPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<StoredPolicy>, StoreError> {
        Ok(self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, stored: &StoredPolicy) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(stored.clone());
        Ok(())
    }
}

struct Current {
    policy: Arc<Policy>,
    updated_at: DateTime<Utc>,
    loaded_at: Instant,
}

pub struct PolicyStore<P: PolicyPersistence> {
    persistence: P,
    ttl: Duration,
    current: RwLock<Option<Current>>,
    /// Held across read-edit-save-install so every update gets its own version.
    writer: Mutex<()>,
    fallback: Arc<Policy>,
}

impl<P: PolicyPersistence> PolicyStore<P> {
    pub fn new(persistence: P, ttl: Duration) -> Self {
        Self {
            persistence,
            ttl,
            current: RwLock::new(None),
            writer: Mutex::new(()),
            fallback: Arc::new(Policy::default()),
        }
    }

    /// Load the persisted policy, or seed persistence with the bundled default.
    pub fn initialize(&self) -> Result<Arc<Policy>, StoreError> {
        let stored = match self.persistence.load()? {
            Some(stored) => {
                tracing::info!(
                    version = stored.policy.version,
                    updated_at = %stored.updated_at,
                    "policy loaded"
                );
                stored
            }
            None => {
                let stored = StoredPolicy {
                    policy: Policy::default(),
                    updated_at: Utc::now(),
                };
                self.persistence.save(&stored)?;
                tracing::info!("no stored policy; seeded bundled default");
                stored
            }
        };
        Ok(self.install(stored))
    }

    pub fn is_initialized(&self) -> bool {
        self.read().is_some()
    }

    /// Current snapshot. Before `initialize()` this is the bundled default.
    pub fn snapshot(&self) -> Arc<Policy> {
        self.read()
            .as_ref()
            .map(|c| Arc::clone(&c.policy))
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Reload from persistence if the snapshot is older than the TTL.
    pub fn refresh(&self) -> Result<Arc<Policy>, StoreError> {
        let stale = match self.read().as_ref() {
            Some(c) => c.loaded_at.elapsed() >= self.ttl,
            None => return Err(StoreError::NotInitialized),
        };
        if !stale {
            return Ok(self.snapshot());
        }
        self.force_refresh()
    }

    /// Reload from persistence now. A stored copy older than the current
    /// snapshot is ignored (last write wins).
    pub fn force_refresh(&self) -> Result<Arc<Policy>, StoreError> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        let Some(stored) = self.persistence.load()? else {
            self.touch();
            return Ok(self.snapshot());
        };

        let newer = self
            .read()
            .as_ref()
            .map_or(true, |c| stored.updated_at >= c.updated_at);
        if newer {
            tracing::debug!(version = stored.policy.version, "policy refreshed");
            Ok(self.install(stored))
        } else {
            tracing::debug!("stored policy older than snapshot; keeping snapshot");
            self.touch();
            Ok(self.snapshot())
        }
    }

    /// Produce and persist a new snapshot with `version + 1`. The new rules
    /// must validate.
    pub fn update<F>(&self, edit: F) -> Result<Arc<Policy>, StoreError>
    where
        F: FnOnce(&mut Policy),
    {
        let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let base = match self.read().as_ref() {
            Some(c) => Arc::clone(&c.policy),
            None => return Err(StoreError::NotInitialized),
        };
        let mut next = (*base).clone();
        edit(&mut next);
        next.rules.validate()?;
        next.version = base.version + 1;

        let stored = StoredPolicy {
            policy: next,
            updated_at: Utc::now(),
        };
        self.persistence.save(&stored)?;
        tracing::info!(version = stored.policy.version, "policy updated");
        Ok(self.install(stored))
    }

    /// Write an operating point chosen offline (e.g. from a ROC report)
    /// into the base rules.
    pub fn apply_operating_point(
        &self,
        match_threshold: f32,
        uncertain_threshold: f32,
    ) -> Result<Arc<Policy>, StoreError> {
        self.update(|p| {
            p.rules.global_match_threshold = match_threshold;
            p.rules.uncertain_threshold = uncertain_threshold;
        })
    }

    fn install(&self, stored: StoredPolicy) -> Arc<Policy> {
        let policy = Arc::new(stored.policy);
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(Current {
            policy: Arc::clone(&policy),
            updated_at: stored.updated_at,
            loaded_at: Instant::now(),
        });
        policy
    }

    fn touch(&self) {
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        if let Some(c) = guard.as_mut() {
            c.loaded_at = Instant::now();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Current>> {
        self.current.read().unwrap_or_else(|p| p.into_inner())
    }
}
