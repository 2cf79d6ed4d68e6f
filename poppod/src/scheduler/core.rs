//! The dispatch loop
//!
//! A single cooperative task that, on every tick, gathers the eligible
//! projects, consults the rate-limit coordinator, picks one project through
//! the configured policy, and hands its head task to the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::config::{GlobalConfig, SchedulingStrategy};
use crate::queue::TaskQueue;
use crate::ratelimit::{Decision, RateLimitCoordinator, RejectReason};
use crate::registry::{ProjectFilter, ProjectRegistry};
use crate::workers::WorkerPool;

use super::fairness::{FairnessLedger, FairnessReport};
use super::policy::{Candidate, Policy};

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub strategy: SchedulingStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            strategy: SchedulingStrategy::default(),
        }
    }
}

/// Scheduler state for the IPC surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub strategy: SchedulingStrategy,
    pub fairness: FairnessReport,
}

/// The multi-project scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    shared: Arc<RwLock<GlobalConfig>>,
    registry: Arc<ProjectRegistry>,
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimitCoordinator>,
    pool: Arc<WorkerPool>,
    fairness: Arc<Mutex<FairnessLedger>>,
    policy: Mutex<Policy>,
    last_dispatch: Mutex<HashMap<String, Instant>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        shared: Arc<RwLock<GlobalConfig>>,
        registry: Arc<ProjectRegistry>,
        queue: Arc<TaskQueue>,
        limiter: Arc<RateLimitCoordinator>,
        pool: Arc<WorkerPool>,
        fairness: Arc<Mutex<FairnessLedger>>,
    ) -> Self {
        let policy = Policy::for_strategy(config.strategy);
        Self {
            config,
            shared,
            registry,
            queue,
            limiter,
            pool,
            fairness,
            policy: Mutex::new(policy),
            last_dispatch: Mutex::new(HashMap::new()),
        }
    }

    /// The dispatch loop; runs until the shutdown token flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(strategy = ?self.config.strategy, "Scheduler started");
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// One scheduling decision. Returns the dispatched project, if any.
    ///
    /// Public so tests can drive the scheduler deterministically.
    pub async fn tick(&self) -> Option<String> {
        if self.limiter.session_invalid().await {
            return None;
        }
        if self.queue.is_paused().await || self.pool.is_paused().await {
            return None;
        }
        if self.pool.idle_workers().await == 0 {
            return None;
        }

        let max_processes = self.shared.read().await.daemon.max_processes;
        if self.queue.total_running().await >= max_processes {
            return None;
        }

        let mut candidates = self.collect_candidates().await;
        if candidates.is_empty() {
            return None;
        }

        let mut policy = self.policy.lock().await;
        while !candidates.is_empty() {
            let Some(picked) = policy.pick(&candidates) else {
                return None;
            };

            match self.limiter.reserve(&picked, None).await {
                Decision::Allow => {
                    drop(policy);
                    return self.dispatch(&picked).await;
                }
                Decision::DelayFor(delay) => {
                    debug!(project_id = %picked, ?delay, "Dispatch delayed by quota");
                    candidates.retain(|c| c.project_id != picked);
                }
                Decision::Reject(RejectReason::Quota) => {
                    debug!(project_id = %picked, "Dispatch rejected: estimate exceeds quota");
                    candidates.retain(|c| c.project_id != picked);
                }
                Decision::Reject(RejectReason::EmergencyStop)
                | Decision::Reject(RejectReason::SessionInvalid) => {
                    return None;
                }
            }
        }
        None
    }

    async fn collect_candidates(&self) -> Vec<Candidate> {
        let now = Utc::now();
        let projects = self
            .registry
            .list(&ProjectFilter {
                enabled: Some(true),
                ..Default::default()
            })
            .await;

        let last_dispatch = self.last_dispatch.lock().await;
        let mut candidates = Vec::new();
        for project in projects {
            if !project.in_active_hours(now) {
                continue;
            }
            if self.queue.queued_count(&project.id).await == 0 {
                continue;
            }
            if self.queue.running_count(&project.id).await >= project.resources.max_concurrent {
                continue;
            }
            candidates.push(Candidate {
                idle_for: last_dispatch
                    .get(&project.id)
                    .map(Instant::elapsed)
                    .unwrap_or(Duration::MAX),
                nearest_deadline: self.queue.nearest_deadline(&project.id).await,
                priority: project.priority,
                weight: project.weight,
                project_id: project.id,
            });
        }
        candidates
    }

    async fn dispatch(&self, project_id: &str) -> Option<String> {
        let task = self.queue.dequeue(project_id).await?;

        if let Err(e) = self.pool.submit(task.clone()).await {
            // Lost the race for a worker; the task goes back untouched
            warn!(task_id = %task.task_id, error = %e, "Submit failed, re-queueing");
            let _ = self.queue.requeue_preserved(&task.task_id).await;
            return None;
        }

        self.fairness.lock().await.record(project_id);
        self.last_dispatch
            .lock()
            .await
            .insert(project_id.to_string(), Instant::now());
        debug!(project_id = %project_id, task_id = %task.task_id, "Dispatched");
        Some(project_id.to_string())
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            strategy: self.config.strategy,
            fairness: self.fairness.lock().await.report(),
        }
    }

    /// Drop per-project policy state when a project goes away
    pub async fn forget_project(&self, project_id: &str) {
        self.policy.lock().await.forget(project_id);
        self.last_dispatch.lock().await.remove(project_id);
    }
}
