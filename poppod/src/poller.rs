//! Per-project work polling
//!
//! The daemon does not talk to GitHub itself; a `WorkSource` implementation
//! (the GitHub adapter, or an in-memory source in tests) produces work items
//! and a poller task per enabled project drives it on the project's
//! `pollingInterval`, feeding the task queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::{NewTask, TaskQueue};
use crate::registry::{ProjectFilter, ProjectRecord, ProjectRegistry};

/// How often the poller set reconciles against the registry
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// One unit of work produced by a source
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

fn default_priority() -> u8 {
    50
}

/// Source of work items for a project
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn poll(&self, project: &ProjectRecord) -> eyre::Result<Vec<WorkItem>>;
}

/// Source that never produces work; the default until an adapter is wired in
pub struct NullWorkSource;

#[async_trait]
impl WorkSource for NullWorkSource {
    async fn poll(&self, _project: &ProjectRecord) -> eyre::Result<Vec<WorkItem>> {
        Ok(Vec::new())
    }
}

/// Keeps one poller task alive per enabled project
pub struct PollerSet {
    source: Arc<dyn WorkSource>,
    registry: Arc<ProjectRegistry>,
    queue: Arc<TaskQueue>,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PollerSet {
    pub fn new(
        source: Arc<dyn WorkSource>,
        registry: Arc<ProjectRegistry>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            source,
            registry,
            queue,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciliation loop; runs until the shutdown token flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Stop every poller on the way out
        let mut pollers = self.pollers.lock().await;
        for (_, handle) in pollers.drain() {
            handle.abort();
        }
        info!("Pollers stopped");
    }

    /// Start pollers for new enabled projects, stop pollers for gone ones
    pub async fn reconcile(&self) {
        let enabled: HashMap<String, ProjectRecord> = self
            .registry
            .list(&ProjectFilter {
                enabled: Some(true),
                ..Default::default()
            })
            .await
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut pollers = self.pollers.lock().await;
        pollers.retain(|id, handle| {
            let keep = enabled.contains_key(id) && !handle.is_finished();
            if !keep {
                handle.abort();
                debug!(project_id = %id, "Poller stopped");
            }
            keep
        });

        for (id, _) in enabled {
            if !pollers.contains_key(&id) {
                debug!(project_id = %id, "Poller started");
                let handle = tokio::spawn(poll_project(
                    id.clone(),
                    Arc::clone(&self.source),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.queue),
                ));
                pollers.insert(id, handle);
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.pollers.lock().await.len()
    }
}

async fn poll_project(
    project_id: String,
    source: Arc<dyn WorkSource>,
    registry: Arc<ProjectRegistry>,
    queue: Arc<TaskQueue>,
) {
    loop {
        // Re-fetch the record each cycle so interval updates apply live
        let Some(project) = registry.get(&project_id).await else {
            break;
        };
        if !project.enabled {
            break;
        }

        match source.poll(&project).await {
            Ok(items) => {
                for item in items {
                    let result = queue
                        .enqueue(NewTask {
                            project_id: project_id.clone(),
                            task_type: item.task_type,
                            payload: item.payload,
                            priority: item.priority,
                            deadline: item.deadline,
                            max_attempts: None,
                        })
                        .await;
                    if let Err(e) = result {
                        warn!(project_id = %project_id, error = %e, "Enqueue from poll failed");
                    }
                }
            }
            Err(e) => warn!(project_id = %project_id, error = %e, "Poll failed"),
        }

        tokio::time::sleep(Duration::from_millis(project.polling_interval)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::queue::QueueConfig;
    use crate::registry::ProjectPatch;
    use crate::store::StateStore;
    use tempfile::TempDir;

    struct OneShotSource;

    #[async_trait]
    impl WorkSource for OneShotSource {
        async fn poll(&self, project: &ProjectRecord) -> eyre::Result<Vec<WorkItem>> {
            Ok(vec![WorkItem {
                task_type: "issue".into(),
                payload: serde_json::json!({"project": project.id}),
                priority: 60,
                deadline: None,
            }])
        }
    }

    #[tokio::test]
    async fn test_reconcile_tracks_enabled_projects() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(temp.path().join("state")).unwrap());
        let bus = EventBus::default();
        let registry = Arc::new(ProjectRegistry::open(store, bus.clone(), 20).await);
        let queue = Arc::new(TaskQueue::new(QueueConfig::default(), bus));

        let dir = temp.path().join("project");
        std::fs::create_dir_all(&dir).unwrap();
        let record = registry.register(dir, ProjectPatch::default()).await.unwrap();

        let pollers = PollerSet::new(Arc::new(OneShotSource), Arc::clone(&registry), Arc::clone(&queue));
        pollers.reconcile().await;
        assert_eq!(pollers.active_count().await, 1);

        // First poll fires immediately
        for _ in 0..50 {
            if queue.queued_count(&record.id).await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.queued_count(&record.id).await >= 1);

        registry.set_enabled(&record.id, false).await.unwrap();
        pollers.reconcile().await;
        assert_eq!(pollers.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_null_source_produces_nothing() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(temp.path().join("state")).unwrap());
        let bus = EventBus::default();
        let registry = Arc::new(ProjectRegistry::open(store, bus.clone(), 20).await);
        let record = {
            let dir = temp.path().join("project");
            std::fs::create_dir_all(&dir).unwrap();
            registry.register(dir, ProjectPatch::default()).await.unwrap()
        };

        let items = NullWorkSource.poll(&registry.get(&record.id).await.unwrap()).await.unwrap();
        assert!(items.is_empty());
    }
}
