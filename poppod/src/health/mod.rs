//! Health tracker - periodic project probes off the scheduler's hot path

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::events::{DaemonEvent, EventBus};
use crate::registry::health::{
    HealthHistory, HealthRecord, HealthTrend, SECURITY_ALERT_SCORE, STALENESS_ALERT_DAYS, measure,
};
use crate::registry::{ProjectFilter, ProjectRegistry};

/// Health tracker timing
#[derive(Debug, Clone)]
pub struct HealthTrackerConfig {
    pub check_interval: Duration,
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
        }
    }
}

/// Periodically measures every enabled project and feeds the registry
pub struct HealthTracker {
    config: HealthTrackerConfig,
    registry: Arc<ProjectRegistry>,
    bus: EventBus,
    histories: Mutex<HashMap<String, HealthHistory>>,
}

impl HealthTracker {
    pub fn new(config: HealthTrackerConfig, registry: Arc<ProjectRegistry>, bus: EventBus) -> Self {
        Self {
            config,
            registry,
            bus,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Probe loop; runs until the shutdown token flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            "Health tracker started"
        );
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately, giving every
        // project a baseline measurement at boot.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health tracker stopped");
    }

    /// Measure every enabled project once, probing them concurrently
    pub async fn check_all(&self) -> usize {
        let projects = self
            .registry
            .list(&ProjectFilter {
                enabled: Some(true),
                ..Default::default()
            })
            .await;

        let checks = projects.iter().map(|p| self.check_project(&p.id));
        futures::future::join_all(checks)
            .await
            .into_iter()
            .flatten()
            .count()
    }

    /// Measure one project, cache the record, raise alerts
    pub async fn check_project(&self, project_id: &str) -> Option<HealthRecord> {
        let project = self.registry.get(project_id).await?;
        let (components, staleness_days) = measure(&project.path, &project.stats);
        let record = HealthRecord::from_components(components, staleness_days, Utc::now());
        debug!(project_id, score = record.score, grade = %record.grade, "Health measured");

        // Alerts compare against the previous cached record
        if let Some(previous) = &project.health
            && previous.components.availability > 0.0
            && components.availability == 0.0
        {
            self.alert(project_id, "project directory became unavailable");
        }
        if staleness_days > STALENESS_ALERT_DAYS {
            self.alert(
                project_id,
                &format!("no changes for {staleness_days} days"),
            );
        }
        if components.security < SECURITY_ALERT_SCORE {
            self.alert(
                project_id,
                &format!("security score {:.0} below {SECURITY_ALERT_SCORE:.0}", components.security),
            );
        }

        self.histories
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .push(f64::from(record.score));

        if let Err(e) = self.registry.store_health(project_id, record.clone()).await {
            warn!(project_id, error = %e, "Failed to store health record");
        }
        Some(record)
    }

    fn alert(&self, project_id: &str, detail: &str) {
        warn!(project_id, detail, "Health alert");
        self.bus.emit(DaemonEvent::HealthAlert {
            project_id: project_id.to_string(),
            detail: detail.to_string(),
        });
    }

    /// Trend over the project's retained measurements
    pub async fn trend(&self, project_id: &str) -> Option<HealthTrend> {
        self.histories
            .lock()
            .await
            .get(project_id)
            .map(HealthHistory::trend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProjectPatch;
    use crate::store::StateStore;
    use tempfile::TempDir;

    async fn setup(temp: &TempDir) -> (Arc<HealthTracker>, Arc<ProjectRegistry>, EventBus, String) {
        let store = Arc::new(StateStore::open(temp.path().join("state")).unwrap());
        let bus = EventBus::default();
        let registry = Arc::new(ProjectRegistry::open(store, bus.clone(), 20).await);

        let project_dir = temp.path().join("project");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join(".gitignore"), "target/").unwrap();
        std::fs::write(project_dir.join("README.md"), "# demo").unwrap();

        let record = registry
            .register(project_dir, ProjectPatch::default())
            .await
            .unwrap();

        let tracker = Arc::new(HealthTracker::new(
            HealthTrackerConfig::default(),
            Arc::clone(&registry),
            bus.clone(),
        ));
        (tracker, registry, bus, record.id)
    }

    #[tokio::test]
    async fn test_check_caches_record_on_registry() {
        let temp = TempDir::new().unwrap();
        let (tracker, registry, _bus, id) = setup(&temp).await;

        let record = tracker.check_project(&id).await.unwrap();
        assert!(record.score > 0);

        let cached = registry.get(&id).await.unwrap().health.unwrap();
        assert_eq!(cached.score, record.score);
        assert_eq!(cached.grade, record.grade);
    }

    #[tokio::test]
    async fn test_check_all_counts_enabled_projects() {
        let temp = TempDir::new().unwrap();
        let (tracker, registry, _bus, id) = setup(&temp).await;

        assert_eq!(tracker.check_all().await, 1);

        registry.set_enabled(&id, false).await.unwrap();
        assert_eq!(tracker.check_all().await, 0);
    }

    #[tokio::test]
    async fn test_low_security_raises_alert() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(temp.path().join("state")).unwrap());
        let bus = EventBus::default();
        let registry = Arc::new(ProjectRegistry::open(store, bus.clone(), 20).await);

        // Bare directory with a committed .env scores 0 on security
        let project_dir = temp.path().join("insecure");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join(".env"), "SECRET=x").unwrap();
        let record = registry
            .register(project_dir, ProjectPatch::default())
            .await
            .unwrap();

        let mut events = bus.subscribe();
        let tracker = HealthTracker::new(HealthTrackerConfig::default(), registry, bus.clone());
        tracker.check_project(&record.id).await.unwrap();

        let mut saw_alert = false;
        while let Ok(event) = events.try_recv() {
            if event.name() == "health-alert" {
                saw_alert = true;
            }
        }
        assert!(saw_alert);
    }

    #[tokio::test]
    async fn test_trend_builds_from_history() {
        let temp = TempDir::new().unwrap();
        let (tracker, _registry, _bus, id) = setup(&temp).await;

        assert!(tracker.trend(&id).await.is_none());
        for _ in 0..4 {
            tracker.check_project(&id).await.unwrap();
        }
        assert_eq!(tracker.trend(&id).await, Some(HealthTrend::Stable));
    }
}
