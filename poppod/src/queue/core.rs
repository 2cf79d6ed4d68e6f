//! Per-project priority queues with aging and snapshot/restore

use std::collections::{BTreeMap, HashMap};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::events::{DaemonEvent, EventBus};

use super::task::{AgingPolicy, NewTask, Task, TaskState};

/// Queue capacity and aging configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub per_project_cap: usize,
    pub global_cap: usize,
    pub default_max_attempts: u32,
    pub aging: AgingPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            per_project_cap: 100,
            global_cap: 1000,
            default_max_attempts: 3,
            aging: AgingPolicy::default(),
        }
    }
}

/// Heap entry ordered by effective priority, FIFO among ties
struct HeapEntry {
    effective: f64,
    seq: u64,
    task: Task,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.effective == other.effective && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.effective
            .total_cmp(&other.effective)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// What happened to a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskDisposition {
    Retried,
    Failed,
}

/// Result of a cancel request
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// Task was queued and has been removed
    CancelledQueued,
    /// Task is currently running; the caller decides whether to kill it
    Running(Task),
    NotFound,
}

/// The persisted `queue-snapshot.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub projects: BTreeMap<String, Vec<Task>>,
    pub taken_at: DateTime<Utc>,
}

/// Live queue status for the IPC surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued: BTreeMap<String, usize>,
    pub running: usize,
    pub total_queued: usize,
    pub paused: Option<String>,
}

struct QueueInner {
    queues: HashMap<String, BinaryHeap<HeapEntry>>,
    running: HashMap<String, Task>,
    paused: Option<String>,
    seq: u64,
    /// Exponentially-weighted average execution time per project (ms)
    avg_exec_ms: HashMap<String, f64>,
}

impl QueueInner {
    fn avg_exec(&self, project_id: &str) -> f64 {
        self.avg_exec_ms.get(project_id).copied().unwrap_or(60_000.0)
    }

    fn total_queued(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }
}

/// Per-project priority queues of work items
pub struct TaskQueue {
    config: QueueConfig,
    bus: EventBus,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            inner: Mutex::new(QueueInner {
                queues: HashMap::new(),
                running: HashMap::new(),
                paused: None,
                seq: 0,
                avg_exec_ms: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a new task, enforcing per-project and global caps
    pub async fn enqueue(&self, new: NewTask) -> Result<Task, DaemonError> {
        let now = Utc::now();
        let task = Task::from_new(new, self.config.default_max_attempts, now);

        {
            let mut inner = self.inner.lock().await;
            let project_queue_len = inner
                .queues
                .get(&task.project_id)
                .map_or(0, BinaryHeap::len);
            if project_queue_len >= self.config.per_project_cap {
                return Err(DaemonError::QueueFull {
                    project_id: task.project_id.clone(),
                    limit: self.config.per_project_cap,
                });
            }
            if inner.total_queued() >= self.config.global_cap {
                return Err(DaemonError::QueueFull {
                    project_id: task.project_id.clone(),
                    limit: self.config.global_cap,
                });
            }
            self.push_entry(&mut inner, task.clone(), now);
        }

        debug!(task_id = %task.task_id, project_id = %task.project_id, "Task enqueued");
        self.bus.emit(DaemonEvent::TaskQueued {
            task_id: task.task_id.clone(),
            project_id: task.project_id.clone(),
        });
        self.notify.notify_one();
        Ok(task)
    }

    /// Re-insert a task that already exists (retry, restore, rate-limit
    /// return). Bypasses capacity checks: the task was already accounted for.
    pub async fn enqueue_existing(&self, mut task: Task) {
        task.state = TaskState::Queued;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        self.push_entry(&mut inner, task, now);
        drop(inner);
        self.notify.notify_one();
    }

    fn push_entry(&self, inner: &mut QueueInner, mut task: Task, now: DateTime<Utc>) {
        let avg = inner.avg_exec(&task.project_id);
        task.state = TaskState::Queued;
        task.effective_priority = self.config.aging.effective_priority(&task, now, avg);
        inner.seq += 1;
        let entry = HeapEntry {
            effective: task.effective_priority,
            seq: inner.seq,
            task,
        };
        inner
            .queues
            .entry(entry.task.project_id.clone())
            .or_default()
            .push(entry);
    }

    /// Pop the highest-priority task of a project and mark it running
    pub async fn dequeue(&self, project_id: &str) -> Option<Task> {
        let task = {
            let mut inner = self.inner.lock().await;
            if inner.paused.is_some() {
                return None;
            }
            let queue = inner.queues.get_mut(project_id)?;
            let mut entry = queue.pop()?;
            if queue.is_empty() {
                inner.queues.remove(project_id);
            }
            entry.task.state = TaskState::Running;
            inner.running.insert(entry.task.task_id.clone(), entry.task.clone());
            entry.task
        };

        debug!(task_id = %task.task_id, project_id = %project_id, "Task dispatched");
        self.bus.emit(DaemonEvent::TaskStarted {
            task_id: task.task_id.clone(),
            project_id: task.project_id.clone(),
        });
        Some(task)
    }

    /// Mark a running task successfully completed
    pub async fn complete(&self, task_id: &str, duration_ms: u64) -> Result<Task, DaemonError> {
        let task = {
            let mut inner = self.inner.lock().await;
            let mut task = inner
                .running
                .remove(task_id)
                .ok_or_else(|| DaemonError::TaskNotFound(task_id.to_string()))?;
            task.state = TaskState::Completed;
            let avg = inner.avg_exec(&task.project_id);
            inner
                .avg_exec_ms
                .insert(task.project_id.clone(), avg * 0.8 + duration_ms as f64 * 0.2);
            task
        };

        self.bus.emit(DaemonEvent::TaskCompleted {
            task_id: task.task_id.clone(),
            project_id: task.project_id.clone(),
        });
        self.notify.notify_one();
        Ok(task)
    }

    /// Record a failed attempt; retries while attempts remain
    pub async fn fail(
        &self,
        task_id: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<TaskDisposition, DaemonError> {
        let (disposition, task) = {
            let mut inner = self.inner.lock().await;
            let mut task = inner
                .running
                .remove(task_id)
                .ok_or_else(|| DaemonError::TaskNotFound(task_id.to_string()))?;
            task.attempts += 1;

            if retryable && task.attempts < task.max_attempts {
                let now = Utc::now();
                let retry = task.clone();
                self.push_entry(&mut inner, retry, now);
                (TaskDisposition::Retried, task)
            } else {
                task.state = TaskState::Failed;
                (TaskDisposition::Failed, task)
            }
        };

        match disposition {
            TaskDisposition::Retried => {
                debug!(task_id = %task.task_id, attempts = task.attempts, "Task retried");
            }
            _ => {
                warn!(task_id = %task.task_id, %reason, "Task failed");
                self.bus.emit(DaemonEvent::TaskFailed {
                    task_id: task.task_id.clone(),
                    project_id: task.project_id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        self.notify.notify_one();
        Ok(disposition)
    }

    /// Return a running task to the queue without consuming an attempt.
    ///
    /// Used when the failure was not the task's fault: rate-limit lockout,
    /// session expiry, or a dispatch race.
    pub async fn requeue_preserved(&self, task_id: &str) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .running
            .remove(task_id)
            .ok_or_else(|| DaemonError::TaskNotFound(task_id.to_string()))?;
        let now = Utc::now();
        self.push_entry(&mut inner, task, now);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Cancel a task wherever it is
    pub async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let mut inner = self.inner.lock().await;

        if let Some(task) = inner.running.get(task_id).cloned() {
            return CancelOutcome::Running(task);
        }

        let mut found: Option<Task> = None;
        for queue in inner.queues.values_mut() {
            if queue.iter().any(|e| e.task.task_id == task_id) {
                let entries: Vec<HeapEntry> = std::mem::take(queue)
                    .into_iter()
                    .filter_map(|e| {
                        if e.task.task_id == task_id {
                            found = Some(e.task.clone());
                            None
                        } else {
                            Some(e)
                        }
                    })
                    .collect();
                *queue = entries.into_iter().collect();
                break;
            }
        }
        inner.queues.retain(|_, q| !q.is_empty());

        match found {
            Some(task) => {
                drop(inner);
                info!(task_id = %task.task_id, "Task cancelled");
                self.bus.emit(DaemonEvent::TaskFailed {
                    task_id: task.task_id.clone(),
                    project_id: task.project_id.clone(),
                    reason: "cancelled".into(),
                });
                CancelOutcome::CancelledQueued
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Remove a running task and hand it back to the caller.
    ///
    /// Used by the worker pool when it needs custom retry handling (delayed
    /// re-enqueue) that the plain `fail` path does not cover.
    pub async fn take_running(&self, task_id: &str) -> Result<Task, DaemonError> {
        let mut inner = self.inner.lock().await;
        inner
            .running
            .remove(task_id)
            .ok_or_else(|| DaemonError::TaskNotFound(task_id.to_string()))
    }

    /// Stop all dispatch until `resume` is called
    pub async fn pause(&self, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.paused.is_none() {
            info!(%reason, "Queue paused");
            self.bus.emit(DaemonEvent::QueuePaused { reason: reason.clone() });
        }
        inner.paused = Some(reason);
    }

    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        if inner.paused.take().is_some() {
            info!("Queue resumed");
            self.bus.emit(DaemonEvent::QueueResumed);
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.lock().await.paused.is_some()
    }

    /// Remove queued tasks, optionally only those at or below a base priority
    pub async fn clear(&self, max_priority: Option<u8>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        for queue in inner.queues.values_mut() {
            let kept: Vec<HeapEntry> = std::mem::take(queue)
                .into_iter()
                .filter(|e| {
                    let drop_it = max_priority.is_none_or(|max| e.task.priority <= max);
                    if drop_it {
                        removed += 1;
                    }
                    !drop_it
                })
                .collect();
            *queue = kept.into_iter().collect();
        }
        inner.queues.retain(|_, q| !q.is_empty());
        removed
    }

    // === Introspection for the scheduler and IPC ===

    pub async fn queued_count(&self, project_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .queues
            .get(project_id)
            .map_or(0, BinaryHeap::len)
    }

    pub async fn running_count(&self, project_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .running
            .values()
            .filter(|t| t.project_id == project_id)
            .count()
    }

    pub async fn total_running(&self) -> usize {
        self.inner.lock().await.running.len()
    }

    pub async fn total_queued(&self) -> usize {
        self.inner.lock().await.total_queued()
    }

    /// Nearest deadline among a project's queued tasks
    pub async fn nearest_deadline(&self, project_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .await
            .queues
            .get(project_id)?
            .iter()
            .filter_map(|e| e.task.deadline)
            .min()
    }

    /// Average execution time estimate for a project (ms)
    pub async fn avg_exec_ms(&self, project_id: &str) -> f64 {
        self.inner.lock().await.avg_exec(project_id)
    }

    pub async fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().await;
        QueueStatus {
            queued: inner
                .queues
                .iter()
                .map(|(id, q)| (id.clone(), q.len()))
                .collect(),
            running: inner.running.len(),
            total_queued: inner.total_queued(),
            paused: inner.paused.clone(),
        }
    }

    /// Wait until the queue changes (new task, completion, resume)
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    // === Aging ===

    /// Recompute every queued task's effective priority
    pub async fn recompute_priorities(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let avgs: HashMap<String, f64> = inner
            .queues
            .keys()
            .map(|id| (id.clone(), inner.avg_exec(id)))
            .collect();

        for (project_id, queue) in inner.queues.iter_mut() {
            let avg = avgs.get(project_id).copied().unwrap_or(60_000.0);
            let rebuilt: BinaryHeap<HeapEntry> = std::mem::take(queue)
                .into_iter()
                .map(|mut entry| {
                    entry.task.effective_priority =
                        self.config.aging.effective_priority(&entry.task, now, avg);
                    entry.effective = entry.task.effective_priority;
                    entry
                })
                .collect();
            *queue = rebuilt;
        }
    }

    /// Periodic aging loop; runs until the shutdown token flips
    pub async fn run_aging(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.aging.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.recompute_priorities().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // === Snapshot / restore ===

    /// Snapshot queued and running tasks for durable storage.
    ///
    /// Running tasks are included as queued so a restart re-runs them with
    /// their attempt counts preserved.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut projects: BTreeMap<String, Vec<Task>> = BTreeMap::new();

        for (project_id, queue) in &inner.queues {
            let mut tasks: Vec<&HeapEntry> = queue.iter().collect();
            tasks.sort_by(|a, b| b.cmp(a));
            projects
                .entry(project_id.clone())
                .or_default()
                .extend(tasks.into_iter().map(|e| e.task.clone()));
        }
        for task in inner.running.values() {
            let mut task = task.clone();
            task.state = TaskState::Queued;
            projects.entry(task.project_id.clone()).or_default().push(task);
        }

        QueueSnapshot {
            projects,
            taken_at: Utc::now(),
        }
    }

    /// Restore a snapshot, re-enqueueing everything in recorded order
    pub async fn restore(&self, snapshot: QueueSnapshot) {
        let mut count = 0;
        for tasks in snapshot.projects.into_values() {
            for task in tasks {
                self.enqueue_existing(task).await;
                count += 1;
            }
        }
        if count > 0 {
            info!(tasks = count, "Queue restored from snapshot");
        }
    }
}
