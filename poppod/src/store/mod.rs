//! Durable state files under the configuration root
//!
//! Every write goes through a temp-file-plus-rename so a crash mid-write
//! never leaves a torn document: a reader sees either the previous blob or
//! the new one. Subscribers are notified after each successful save.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::DaemonError;

/// The durable document kinds the daemon owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// `projects.json` - the project registry document
    Registry,
    /// `queue-snapshot.json` - queued and running tasks
    QueueSnapshot,
    /// `rate-limit.json` - the shared executor-quota ledger
    RateLimit,
    /// `workers.json` - worker states, written for post-mortem only
    Workers,
}

impl StateKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Registry => "projects.json",
            Self::QueueSnapshot => "queue-snapshot.json",
            Self::RateLimit => "rate-limit.json",
            Self::Workers => "workers.json",
        }
    }
}

/// Durable state store rooted at the daemon's configuration directory
pub struct StateStore {
    root: PathBuf,
    change_tx: broadcast::Sender<StateKind>,
}

impl StateStore {
    /// Open (and create if missing) the state root
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create state root {}", root.display()))?;
        std::fs::create_dir_all(root.join("projects")).context("Failed to create projects dir")?;
        std::fs::create_dir_all(root.join("logs")).context("Failed to create logs dir")?;

        let (change_tx, _) = broadcast::channel(64);
        Ok(Self { root, change_tx })
    }

    /// The state root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a document kind
    pub fn path_for(&self, kind: StateKind) -> PathBuf {
        self.root.join(kind.file_name())
    }

    /// Per-project migrated config directory (`<root>/projects/<id>`)
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(project_id)
    }

    /// Atomically persist a document
    pub async fn save<T: Serialize>(&self, kind: StateKind, value: &T) -> Result<()> {
        let path = self.path_for(kind);
        let tmp = path.with_extension("json.tmp");

        let blob = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
        tokio::fs::write(&tmp, &blob)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;

        debug!(file = kind.file_name(), bytes = blob.len(), "State saved");
        let _ = self.change_tx.send(kind);
        Ok(())
    }

    /// Load a document, returning `None` when it has never been saved.
    ///
    /// An unreadable or unparseable file is a `StateCorrupt` error, not a
    /// silent `None`: the caller decides whether to enter read-only mode.
    pub async fn load<T: DeserializeOwned>(&self, kind: StateKind) -> Result<Option<T>, DaemonError> {
        let path = self.path_for(kind);
        if !path.exists() {
            return Ok(None);
        }

        let blob = tokio::fs::read(&path).await.map_err(|e| {
            warn!(file = kind.file_name(), error = %e, "Failed to read state file");
            DaemonError::StateCorrupt(format!("{}: {}", kind.file_name(), e))
        })?;

        let value = serde_json::from_slice(&blob).map_err(|e| {
            warn!(file = kind.file_name(), error = %e, "Failed to parse state file");
            DaemonError::StateCorrupt(format!("{}: {}", kind.file_name(), e))
        })?;

        Ok(Some(value))
    }

    /// Subscribe to save notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StateKind> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        n: u32,
        s: String,
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();

        let blob = Blob {
            n: 7,
            s: "seven".into(),
        };
        store.save(StateKind::RateLimit, &blob).await.unwrap();

        let loaded: Option<Blob> = store.load(StateKind::RateLimit).await.unwrap();
        assert_eq!(loaded, Some(blob));
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();

        let loaded: Option<Blob> = store.load(StateKind::Workers).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();

        std::fs::write(store.path_for(StateKind::Registry), "{not json").unwrap();

        let result: Result<Option<Blob>, _> = store.load(StateKind::Registry).await;
        assert!(matches!(result, Err(DaemonError::StateCorrupt(_))));
    }

    #[tokio::test]
    async fn test_save_overwrites_atomically() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();

        for n in 0..10u32 {
            let blob = Blob {
                n,
                s: format!("v{n}"),
            };
            store.save(StateKind::QueueSnapshot, &blob).await.unwrap();
        }

        let loaded: Option<Blob> = store.load(StateKind::QueueSnapshot).await.unwrap();
        assert_eq!(loaded.unwrap().n, 9);
        // No temp file left behind
        assert!(!store.path_for(StateKind::QueueSnapshot).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_subscribe_notifies_on_save() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        let mut rx = store.subscribe();

        store
            .save(StateKind::Workers, &Blob { n: 1, s: "x".into() })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), StateKind::Workers);
    }
}
