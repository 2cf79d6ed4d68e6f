//! Project registry - owns the persistent set of project records
//!
//! The registry is the single writer of `projects.json`. Structural changes
//! (register, unregister, move) persist immediately; high-churn updates
//! (stats, health caches) are debounced through a background flusher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::events::{DaemonEvent, EventBus};
use crate::store::{StateKind, StateStore};

use super::health::HealthRecord;
use super::record::{ActiveHours, ProjectRecord, ProjectResources, RegistryDocument};
use super::validation::{ValidationReport, validate_project_dir};

/// Debounce window for high-churn registry writes
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);

/// Partial project settings applied at registration or update time
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectPatch {
    pub enabled: Option<bool>,
    pub priority: Option<u8>,
    pub weight: Option<f64>,
    pub polling_interval: Option<u64>,
    pub resources: Option<ProjectResources>,
    pub active_hours: Option<ActiveHours>,
}

impl ProjectPatch {
    fn apply(&self, record: &mut ProjectRecord) {
        if let Some(enabled) = self.enabled {
            record.enabled = enabled;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(weight) = self.weight {
            record.weight = weight;
        }
        if let Some(interval) = self.polling_interval {
            record.polling_interval = interval;
        }
        if let Some(resources) = &self.resources {
            record.resources = resources.clone();
        }
        if let Some(hours) = &self.active_hours {
            record.schedule.active_hours = Some(hours.clone());
        }
    }

    fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.priority.is_none()
            && self.weight.is_none()
            && self.polling_interval.is_none()
            && self.resources.is_none()
            && self.active_hours.is_none()
    }
}

/// Filter for `list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectFilter {
    pub enabled: Option<bool>,
    pub needs_recovery: Option<bool>,
}

/// Aggregate registry statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub enabled: usize,
    pub total_processed: u64,
    pub total_errors: u64,
}

/// The project registry
pub struct ProjectRegistry {
    store: Arc<StateStore>,
    bus: EventBus,
    max_projects: usize,
    doc: Arc<RwLock<RegistryDocument>>,
    read_only: Arc<AtomicBool>,
    persist_tx: mpsc::Sender<()>,
}

impl ProjectRegistry {
    /// Load the registry document and start the debounced flusher.
    ///
    /// A corrupt document flips the registry into read-only mode instead of
    /// failing the boot: the daemon keeps serving reads and refuses writes.
    pub async fn open(store: Arc<StateStore>, bus: EventBus, max_projects: usize) -> Self {
        let read_only = Arc::new(AtomicBool::new(false));
        let doc = match store.load::<RegistryDocument>(StateKind::Registry).await {
            Ok(Some(doc)) => match doc.validate() {
                Ok(()) => {
                    info!(projects = doc.projects.len(), "Registry loaded");
                    doc
                }
                Err(detail) => {
                    warn!(%detail, "Registry document failed validation, entering read-only mode");
                    read_only.store(true, Ordering::SeqCst);
                    bus.emit(DaemonEvent::StateCorrupt { detail });
                    doc
                }
            },
            Ok(None) => RegistryDocument::default(),
            Err(e) => {
                warn!(error = %e, "Registry unreadable, entering read-only mode");
                read_only.store(true, Ordering::SeqCst);
                bus.emit(DaemonEvent::StateCorrupt { detail: e.to_string() });
                RegistryDocument::default()
            }
        };

        let doc = Arc::new(RwLock::new(doc));
        let (persist_tx, persist_rx) = mpsc::channel(64);
        tokio::spawn(persist_loop(
            persist_rx,
            Arc::clone(&doc),
            Arc::clone(&store),
            Arc::clone(&read_only),
        ));

        Self {
            store,
            bus,
            max_projects,
            doc,
            read_only,
            persist_tx,
        }
    }

    /// Whether mutating operations are refused
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn guard_writable(&self) -> Result<(), DaemonError> {
        if self.is_read_only() {
            return Err(DaemonError::ReadOnly("registry".into()));
        }
        Ok(())
    }

    /// Register a project directory, returning the new record
    pub async fn register(
        &self,
        path: PathBuf,
        patch: ProjectPatch,
    ) -> Result<ProjectRecord, DaemonError> {
        self.guard_writable()?;

        if !path.is_absolute() {
            return Err(DaemonError::InvalidArgs(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
        if !path.is_dir() {
            return Err(DaemonError::InvalidArgs(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let now = Utc::now();
        let mut record = ProjectRecord::new(path.clone(), now);
        patch.apply(&mut record);
        let report = validate_project_dir(&path, &record);
        record.validation = Some(report);

        let snapshot = {
            let mut doc = self.doc.write().await;
            if doc.projects.len() >= self.max_projects {
                return Err(DaemonError::RegistryFull {
                    limit: self.max_projects,
                });
            }
            if doc.projects.contains_key(&record.id) {
                return Err(DaemonError::DuplicateProject(record.id.clone()));
            }
            if doc.projects.values().any(|r| r.path == path) {
                return Err(DaemonError::DuplicateProject(path.display().to_string()));
            }

            doc.projects.insert(record.id.clone(), record.clone());
            if let Err(detail) = doc.validate() {
                doc.projects.remove(&record.id);
                return Err(DaemonError::InvalidArgs(detail));
            }

            doc.metadata.total_projects = doc.projects.len();
            doc.metadata.created_at.get_or_insert(now);
            doc.metadata.updated_at = Some(now);
            doc.clone()
        };

        self.store
            .save(StateKind::Registry, &snapshot)
            .await
            .map_err(|e| DaemonError::StateCorrupt(e.to_string()))?;

        info!(project_id = %record.id, path = %path.display(), "Project registered");
        self.bus.emit(DaemonEvent::ProjectRegistered {
            project_id: record.id.clone(),
            path: path.display().to_string(),
        });
        Ok(record)
    }

    /// Remove a project, returning its final record
    pub async fn unregister(&self, id: &str) -> Result<ProjectRecord, DaemonError> {
        self.guard_writable()?;

        let (removed, snapshot) = {
            let mut doc = self.doc.write().await;
            let removed = doc
                .projects
                .remove(id)
                .ok_or_else(|| DaemonError::ProjectNotFound(id.to_string()))?;
            doc.metadata.total_projects = doc.projects.len();
            doc.metadata.updated_at = Some(Utc::now());
            (removed, doc.clone())
        };

        self.store
            .save(StateKind::Registry, &snapshot)
            .await
            .map_err(|e| DaemonError::StateCorrupt(e.to_string()))?;

        info!(project_id = %id, "Project unregistered");
        self.bus.emit(DaemonEvent::ProjectUnregistered {
            project_id: id.to_string(),
        });
        Ok(removed)
    }

    /// Apply a patch to a project's settings
    pub async fn update(&self, id: &str, patch: ProjectPatch) -> Result<ProjectRecord, DaemonError> {
        self.guard_writable()?;
        if patch.is_empty() {
            return Err(DaemonError::InvalidArgs("empty patch".into()));
        }

        let updated = {
            let mut doc = self.doc.write().await;
            let record = doc
                .projects
                .get_mut(id)
                .ok_or_else(|| DaemonError::ProjectNotFound(id.to_string()))?;

            let previous = record.clone();
            patch.apply(record);
            record.updated_at = Utc::now();
            if let Err(detail) = record.check_ranges() {
                *record = previous;
                return Err(DaemonError::InvalidArgs(detail));
            }
            let result = record.clone();
            doc.metadata.updated_at = Some(Utc::now());
            result
        };

        self.persist_soon();
        self.bus.emit(DaemonEvent::ProjectUpdated {
            project_id: id.to_string(),
        });
        Ok(updated)
    }

    /// Enable or disable scheduling for a project
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), DaemonError> {
        self.update(
            id,
            ProjectPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn get(&self, id: &str) -> Option<ProjectRecord> {
        self.doc.read().await.projects.get(id).cloned()
    }

    pub async fn get_by_path(&self, path: &Path) -> Option<ProjectRecord> {
        self.doc
            .read()
            .await
            .projects
            .values()
            .find(|r| r.path == path)
            .cloned()
    }

    pub async fn list(&self, filter: &ProjectFilter) -> Vec<ProjectRecord> {
        self.doc
            .read()
            .await
            .projects
            .values()
            .filter(|r| filter.enabled.is_none_or(|want| r.enabled == want))
            .filter(|r| filter.needs_recovery.is_none_or(|want| r.needs_recovery == want))
            .cloned()
            .collect()
    }

    /// Re-run directory validation and cache the report
    pub async fn validate(&self, id: &str) -> Result<ValidationReport, DaemonError> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| DaemonError::ProjectNotFound(id.to_string()))?;
        let report = validate_project_dir(&record.path, &record);

        {
            let mut doc = self.doc.write().await;
            if let Some(record) = doc.projects.get_mut(id) {
                record.validation = Some(report.clone());
            }
        }
        self.persist_soon();
        Ok(report)
    }

    /// Re-validate every project; returns the number of invalid ones
    pub async fn revalidate_all(&self) -> usize {
        let ids: Vec<String> = self.doc.read().await.projects.keys().cloned().collect();
        let mut invalid = 0;
        for id in ids {
            if let Ok(report) = self.validate(&id).await
                && !report.valid
            {
                invalid += 1;
            }
        }
        invalid
    }

    /// Cache a health measurement on the record
    pub async fn store_health(&self, id: &str, health: HealthRecord) -> Result<(), DaemonError> {
        let mut doc = self.doc.write().await;
        let record = doc
            .projects
            .get_mut(id)
            .ok_or_else(|| DaemonError::ProjectNotFound(id.to_string()))?;
        record.health = Some(health);
        drop(doc);
        self.persist_soon();
        Ok(())
    }

    /// Fold one finished task into the project's rolling stats
    pub async fn record_task_result(&self, id: &str, ok: bool, duration_ms: u64) {
        let mut doc = self.doc.write().await;
        if let Some(record) = doc.projects.get_mut(id) {
            record.stats.record(ok, duration_ms, Utc::now());
        }
        drop(doc);
        self.persist_soon();
    }

    /// Mark a project as needing operator attention after a failed move
    pub async fn mark_needs_recovery(&self, id: &str) {
        let mut doc = self.doc.write().await;
        if let Some(record) = doc.projects.get_mut(id) {
            record.needs_recovery = true;
            record.updated_at = Utc::now();
        }
        drop(doc);
        let _ = self.flush().await;
    }

    pub async fn stats(&self) -> RegistryStats {
        let doc = self.doc.read().await;
        RegistryStats {
            total: doc.projects.len(),
            enabled: doc.projects.values().filter(|r| r.enabled).count(),
            total_processed: doc.projects.values().map(|r| r.stats.total_processed).sum(),
            total_errors: doc.projects.values().map(|r| r.stats.total_errors).sum(),
        }
    }

    /// Persist immediately, bypassing the debounce window
    pub async fn flush(&self) -> Result<(), DaemonError> {
        if self.is_read_only() {
            return Ok(());
        }
        let snapshot = self.doc.read().await.clone();
        self.store
            .save(StateKind::Registry, &snapshot)
            .await
            .map_err(|e| DaemonError::StateCorrupt(e.to_string()))
    }

    fn persist_soon(&self) {
        // A full channel means a flush is already pending
        let _ = self.persist_tx.try_send(());
    }

    pub(super) fn doc_handle(&self) -> Arc<RwLock<RegistryDocument>> {
        Arc::clone(&self.doc)
    }

    pub(super) fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

async fn persist_loop(
    mut rx: mpsc::Receiver<()>,
    doc: Arc<RwLock<RegistryDocument>>,
    store: Arc<StateStore>,
    read_only: Arc<AtomicBool>,
) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(PERSIST_DEBOUNCE).await;
        // Coalesce every request that arrived during the window
        while rx.try_recv().is_ok() {}

        if read_only.load(Ordering::SeqCst) {
            continue;
        }
        let snapshot = doc.read().await.clone();
        if let Err(e) = store.save(StateKind::Registry, &snapshot).await {
            warn!(error = %e, "Debounced registry persist failed");
        } else {
            debug!("Registry persisted (debounced)");
        }
    }
}
