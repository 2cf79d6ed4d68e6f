//! Worker pool - owns executor invocations
//!
//! A fixed set of long-lived worker tasks, each running at most one executor
//! invocation at a time. The pool auto-scales between its bounds on observed
//! load, recycles workers after a task quota to bound resource drift, and
//! classifies every outcome into the retry taxonomy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, ExecutionError};
use crate::events::{DaemonEvent, EventBus};
use crate::queue::{Task, TaskQueue};
use crate::ratelimit::{OutcomeReport, RateLimitCoordinator};
use crate::registry::ProjectRegistry;
use crate::store::{StateKind, StateStore};

use super::executor::{ExecutionOutput, ExecutionRequest, Executor};
use super::outcome::{OutcomeClass, classify, failure_reason};

/// Pool sizing and behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub max_tasks_per_worker: u32,
    pub scale_interval: Duration,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    /// Consecutive executor crashes before the pool pauses itself
    pub crash_limit: u32,
    pub task_timeout: Duration,
    /// Back-off before retrying a transient failure
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 2,
            max_tasks_per_worker: 100,
            scale_interval: Duration::from_secs(10),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            crash_limit: 3,
            task_timeout: Duration::from_secs(600),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Spawning,
    Idle,
    Busy,
    Recycling,
    Dead,
}

/// Observable worker metadata, persisted to `workers.json` for post-mortem
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub worker_id: u64,
    pub state: WorkerState,
    pub tasks_run: u32,
    pub created_at: DateTime<Utc>,
    pub last_task_at: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
}

enum WorkerCommand {
    Run(Box<ExecutionRequest>),
    Retire,
}

enum PoolEvent {
    Finished {
        worker_id: u64,
        task: Task,
        result: Result<ExecutionOutput, ExecutionError>,
    },
    Exited {
        worker_id: u64,
    },
}

struct WorkerSlot {
    info: WorkerInfo,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

struct PoolState {
    workers: HashMap<u64, WorkerSlot>,
    next_worker_id: u64,
    consecutive_crashes: u32,
    paused: bool,
    draining: bool,
}

/// Pool status for the IPC surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub workers: Vec<WorkerInfo>,
    pub idle: usize,
    pub busy: usize,
    pub paused: bool,
    pub consecutive_crashes: u32,
}

/// The worker pool
pub struct WorkerPool {
    config: PoolConfig,
    executor: Arc<dyn Executor>,
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimitCoordinator>,
    registry: Arc<ProjectRegistry>,
    bus: EventBus,
    store: Arc<StateStore>,
    state: Mutex<PoolState>,
    event_tx: mpsc::Sender<PoolEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<PoolEvent>>>,
}

impl WorkerPool {
    /// Build the pool and spawn its minimum worker set.
    ///
    /// The caller must then spawn [`WorkerPool::run`] to process outcomes.
    pub async fn start(
        config: PoolConfig,
        executor: Arc<dyn Executor>,
        queue: Arc<TaskQueue>,
        limiter: Arc<RateLimitCoordinator>,
        registry: Arc<ProjectRegistry>,
        bus: EventBus,
        store: Arc<StateStore>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let pool = Arc::new(Self {
            config,
            executor,
            queue,
            limiter,
            registry,
            bus,
            store,
            state: Mutex::new(PoolState {
                workers: HashMap::new(),
                next_worker_id: 0,
                consecutive_crashes: 0,
                paused: false,
                draining: false,
            }),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        });

        {
            let mut state = pool.state.lock().await;
            for _ in 0..pool.config.min_workers.max(1) {
                pool.spawn_worker(&mut state);
            }
        }
        pool.persist_workers().await;
        pool
    }

    /// Outcome-processing loop plus auto-scaling.
    ///
    /// A shutdown signal stops auto-scaling but keeps processing outcomes:
    /// busy workers still need their results handled so a graceful drain can
    /// complete. The loop exits once the pool is empty.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut event_rx = self
            .event_rx
            .lock()
            .await
            .take()
            .expect("WorkerPool::run called twice");
        let mut scale_timer = tokio::time::interval(self.config.scale_interval);
        scale_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stopping = false;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(PoolEvent::Finished { worker_id, task, result }) => {
                            self.handle_finished(worker_id, task, result).await;
                        }
                        Some(PoolEvent::Exited { worker_id }) => {
                            self.handle_exited(worker_id).await;
                        }
                        None => break,
                    }
                }
                _ = scale_timer.tick(), if !stopping => {
                    self.autoscale().await;
                }
                changed = shutdown.changed(), if !stopping => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)), if stopping => {}
            }
            if stopping && self.state.lock().await.workers.is_empty() {
                break;
            }
        }
        debug!("Worker pool loop stopped");
    }

    fn spawn_worker(&self, state: &mut PoolState) -> u64 {
        state.next_worker_id += 1;
        let worker_id = state.next_worker_id;
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let handle = tokio::spawn(worker_loop(
            worker_id,
            cmd_rx,
            self.event_tx.clone(),
            Arc::clone(&self.executor),
        ));

        state.workers.insert(
            worker_id,
            WorkerSlot {
                info: WorkerInfo {
                    worker_id,
                    state: WorkerState::Idle,
                    tasks_run: 0,
                    created_at: Utc::now(),
                    last_task_at: None,
                    current_task: None,
                },
                cmd_tx,
                handle,
            },
        );
        debug!(worker_id, "Worker spawned");
        worker_id
    }

    /// Hand a dequeued task to an idle worker.
    ///
    /// The scheduler checks capacity before dequeueing, so failure here is a
    /// race; the caller returns the task to the queue.
    pub async fn submit(&self, task: Task) -> Result<(), DaemonError> {
        let project = self
            .registry
            .get(&task.project_id)
            .await
            .ok_or_else(|| DaemonError::ProjectNotFound(task.project_id.clone()))?;

        let request = ExecutionRequest {
            project_path: project.path.clone(),
            env: vec![
                (
                    "POPPO_PROJECT_PATH".to_string(),
                    project.path.display().to_string(),
                ),
                (
                    "POPPO_MEMORY_LIMIT_MB".to_string(),
                    project.resources.memory_limit_mb.to_string(),
                ),
            ],
            timeout: self.config.task_timeout,
            task: task.clone(),
        };

        let mut state = self.state.lock().await;
        if state.paused || state.draining {
            return Err(DaemonError::InvalidArgs("worker pool is paused".into()));
        }
        let slot = state
            .workers
            .values_mut()
            .find(|slot| slot.info.state == WorkerState::Idle)
            .ok_or_else(|| DaemonError::InvalidArgs("no idle worker".into()))?;

        slot.info.state = WorkerState::Busy;
        slot.info.current_task = Some(task.task_id.clone());
        let send = slot.cmd_tx.try_send(WorkerCommand::Run(Box::new(request)));
        if send.is_err() {
            slot.info.state = WorkerState::Dead;
            slot.info.current_task = None;
            return Err(DaemonError::InvalidArgs("worker channel closed".into()));
        }
        Ok(())
    }

    pub async fn idle_workers(&self) -> usize {
        self.state
            .lock()
            .await
            .workers
            .values()
            .filter(|slot| slot.info.state == WorkerState::Idle)
            .count()
    }

    pub async fn is_paused(&self) -> bool {
        let state = self.state.lock().await;
        state.paused || state.draining
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let workers: Vec<WorkerInfo> = state.workers.values().map(|s| s.info.clone()).collect();
        let idle = workers.iter().filter(|w| w.state == WorkerState::Idle).count();
        let busy = workers.iter().filter(|w| w.state == WorkerState::Busy).count();
        PoolStatus {
            workers,
            idle,
            busy,
            paused: state.paused,
            consecutive_crashes: state.consecutive_crashes,
        }
    }

    /// Scale directly to a target worker count and clear a crash pause
    pub async fn scale_to(&self, target: usize) -> usize {
        let target = target.clamp(1, self.config.max_workers.max(1));
        let mut state = self.state.lock().await;
        state.paused = false;
        state.consecutive_crashes = 0;

        while state.workers.len() < target {
            self.spawn_worker(&mut state);
        }
        if state.workers.len() > target {
            let excess = state.workers.len() - target;
            self.retire_idle(&mut state, excess).await;
        }
        let count = state.workers.len();
        drop(state);
        self.persist_workers().await;
        info!(target, count, "Pool scaled");
        count
    }

    async fn autoscale(&self) {
        let queued = self.queue.total_queued().await;
        let mut state = self.state.lock().await;
        if state.draining {
            return;
        }
        let total = state.workers.len();
        if total == 0 {
            return;
        }
        let busy = state
            .workers
            .values()
            .filter(|s| s.info.state == WorkerState::Busy)
            .count();
        let load = (busy + queued) as f64 / total as f64;

        if load > self.config.scale_up_threshold && total < self.config.max_workers {
            let id = self.spawn_worker(&mut state);
            debug!(load, worker_id = id, "Scaled up");
        } else if load < self.config.scale_down_threshold && total > self.config.min_workers {
            self.retire_idle(&mut state, 1).await;
            debug!(load, "Scaled down");
        }
    }

    async fn retire_idle(&self, state: &mut PoolState, count: usize) {
        let ids: Vec<u64> = state
            .workers
            .values()
            .filter(|s| s.info.state == WorkerState::Idle)
            .take(count)
            .map(|s| s.info.worker_id)
            .collect();
        for id in ids {
            if let Some(slot) = state.workers.get_mut(&id) {
                slot.info.state = WorkerState::Recycling;
                let _ = slot.cmd_tx.try_send(WorkerCommand::Retire);
            }
        }
    }

    async fn handle_finished(
        &self,
        worker_id: u64,
        task: Task,
        result: Result<ExecutionOutput, ExecutionError>,
    ) {
        let outcome = classify(&result);
        let duration_ms = result
            .as_ref()
            .map(|o| o.duration.as_millis() as u64)
            .unwrap_or(0);
        debug!(worker_id, task_id = %task.task_id, ?outcome, "Task finished");

        let crashed = outcome == OutcomeClass::Crash;
        match outcome {
            OutcomeClass::Success { tokens } => {
                let _ = self.queue.complete(&task.task_id, duration_ms).await;
                self.registry
                    .record_task_result(&task.project_id, true, duration_ms)
                    .await;
                self.limiter
                    .record_outcome(
                        &task.project_id,
                        &OutcomeReport {
                            ok: true,
                            tokens,
                            ..Default::default()
                        },
                    )
                    .await;
            }
            OutcomeClass::RateLimit { unlock_at } => {
                // Engage the stop before the task re-enters the queue so no
                // tick can slip it straight back out
                self.limiter.notify_rate_limit(unlock_at).await;
                let _ = self.queue.requeue_preserved(&task.task_id).await;
            }
            OutcomeClass::SessionInvalid => {
                self.limiter.notify_session_invalid().await;
                let _ = self.queue.requeue_preserved(&task.task_id).await;
            }
            OutcomeClass::Timeout => {
                let _ = self.queue.fail(&task.task_id, "executor timeout", true).await;
                self.registry
                    .record_task_result(&task.project_id, false, duration_ms)
                    .await;
            }
            OutcomeClass::Transient => {
                self.retry_transient(&task).await;
                self.registry
                    .record_task_result(&task.project_id, false, duration_ms)
                    .await;
            }
            OutcomeClass::Permanent => {
                let reason = failure_reason(&result);
                // Unrecognized failures get exactly one retry
                let retryable = task.attempts == 0;
                let _ = self.queue.fail(&task.task_id, &reason, retryable).await;
                self.registry
                    .record_task_result(&task.project_id, false, duration_ms)
                    .await;
            }
            OutcomeClass::Crash => {
                let _ = self.queue.fail(&task.task_id, "worker crash", true).await;
                self.registry
                    .record_task_result(&task.project_id, false, duration_ms)
                    .await;
            }
        }

        let mut state = self.state.lock().await;
        if crashed {
            state.consecutive_crashes += 1;
            if state.consecutive_crashes >= self.config.crash_limit && !state.paused {
                warn!(
                    crashes = state.consecutive_crashes,
                    "Worker pool unstable, pausing dispatch"
                );
                state.paused = true;
                self.bus.emit(DaemonEvent::PoolUnstable {
                    consecutive_crashes: state.consecutive_crashes,
                });
            }
        } else {
            state.consecutive_crashes = 0;
        }

        let draining = state.draining;
        if let Some(slot) = state.workers.get_mut(&worker_id) {
            slot.info.tasks_run += 1;
            slot.info.last_task_at = Some(Utc::now());
            slot.info.current_task = None;

            if crashed {
                // Replace a worker whose executor could not run
                slot.info.state = WorkerState::Dead;
                let _ = slot.cmd_tx.try_send(WorkerCommand::Retire);
                self.spawn_worker(&mut state);
            } else if draining || slot.info.tasks_run >= self.config.max_tasks_per_worker {
                slot.info.state = WorkerState::Recycling;
                let _ = slot.cmd_tx.try_send(WorkerCommand::Retire);
            } else {
                slot.info.state = WorkerState::Idle;
            }
        }
        drop(state);
        self.persist_workers().await;
    }

    /// Transient failures retry after a back-off instead of immediately
    async fn retry_transient(&self, task: &Task) {
        let Ok(mut task) = self.queue.take_running(&task.task_id).await else {
            return;
        };
        task.attempts += 1;

        if task.attempts < task.max_attempts {
            let queue = Arc::clone(&self.queue);
            let delay = self.config.retry_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.enqueue_existing(task).await;
            });
        } else {
            warn!(task_id = %task.task_id, "Transient failure exhausted retries");
            self.bus.emit(DaemonEvent::TaskFailed {
                task_id: task.task_id.clone(),
                project_id: task.project_id.clone(),
                reason: "transient failure, retries exhausted".into(),
            });
        }
    }

    async fn handle_exited(&self, worker_id: u64) {
        let mut state = self.state.lock().await;
        state.workers.remove(&worker_id);
        debug!(worker_id, "Worker exited");

        // Hold the configured floor unless shutting down
        if !state.draining {
            while state.workers.len() < self.config.min_workers {
                self.spawn_worker(&mut state);
            }
        }
        drop(state);
        self.persist_workers().await;
    }

    /// Drain the pool. Graceful waits for busy workers up to `deadline`,
    /// then escalates; immediate aborts everything and re-queues the tasks.
    pub async fn shutdown(&self, graceful: bool, deadline: Duration) {
        {
            let mut state = self.state.lock().await;
            state.draining = true;
            self.retire_idle(&mut state, usize::MAX).await;
        }

        if graceful {
            let start = tokio::time::Instant::now();
            loop {
                let busy = {
                    let state = self.state.lock().await;
                    state
                        .workers
                        .values()
                        .filter(|s| s.info.state == WorkerState::Busy)
                        .count()
                };
                if busy == 0 {
                    break;
                }
                if start.elapsed() >= deadline {
                    warn!(busy, "Shutdown deadline reached, escalating");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        // Abort whatever is left and return its tasks to the queue
        let mut state = self.state.lock().await;
        for slot in state.workers.values() {
            slot.handle.abort();
            if let Some(task_id) = &slot.info.current_task {
                let _ = self.queue.requeue_preserved(task_id).await;
            }
        }
        state.workers.clear();
        drop(state);
        self.persist_workers().await;
        info!("Worker pool shut down");
    }

    async fn persist_workers(&self) {
        let status = self.status().await;
        if let Err(e) = self.store.save(StateKind::Workers, &status).await {
            debug!(error = %e, "Failed to persist worker states");
        }
    }
}

async fn worker_loop(
    worker_id: u64,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    event_tx: mpsc::Sender<PoolEvent>,
    executor: Arc<dyn Executor>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            WorkerCommand::Run(request) => {
                let task = request.task.clone();
                let result = executor.execute(&request).await;
                if event_tx
                    .send(PoolEvent::Finished {
                        worker_id,
                        task,
                        result,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            WorkerCommand::Retire => break,
        }
    }
    let _ = event_tx.send(PoolEvent::Exited { worker_id }).await;
}
