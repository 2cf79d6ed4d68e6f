//! Work items and their scheduling priority

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a task. A task is in exactly one state; the queue
/// enforces the transitions Queued -> Running -> {Completed, Failed, Cancelled}
/// with Failed re-entering Queued while attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A unit of work owned by the task queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub project_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// Base priority, 0-100
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub state: TaskState,
    /// Derived scheduling key; recomputed on insert and every aging pass
    #[serde(default)]
    pub effective_priority: f64,
}

/// Parameters for a new task
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub project_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_task_priority")]
    pub priority: u8,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_task_priority() -> u8 {
    50
}

impl Task {
    pub fn from_new(new: NewTask, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            task_id: uuid::Uuid::now_v7().to_string(),
            project_id: new.project_id,
            task_type: new.task_type,
            payload: new.payload,
            priority: new.priority.min(100),
            enqueued_at: now,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts),
            deadline: new.deadline,
            state: TaskState::Queued,
            effective_priority: 0.0,
        }
    }
}

/// Priority aging parameters
#[derive(Debug, Clone)]
pub struct AgingPolicy {
    /// How often queued priorities are recomputed
    pub interval: Duration,
    /// Points added per full interval of waiting
    pub boost_per_interval: f64,
    /// Cap on the age boost so old tasks converge to FIFO among themselves
    pub max_age_boost: f64,
    /// Cap on the deadline boost
    pub max_deadline_boost: f64,
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            boost_per_interval: 1.0,
            max_age_boost: 50.0,
            max_deadline_boost: 100.0,
        }
    }
}

impl AgingPolicy {
    /// Compute a task's effective priority.
    ///
    /// `avg_exec_ms` is the project's estimated execution time; the deadline
    /// boost only kicks in within one estimated execution of the deadline.
    pub fn effective_priority(&self, task: &Task, now: DateTime<Utc>, avg_exec_ms: f64) -> f64 {
        let base = f64::from(task.priority);

        let waited_ms = (now - task.enqueued_at).num_milliseconds().max(0) as f64;
        let intervals = waited_ms / self.interval.as_millis() as f64;
        let age_boost = (intervals * self.boost_per_interval).min(self.max_age_boost);

        let deadline_boost = match task.deadline {
            None => 0.0,
            Some(deadline) => {
                let window = avg_exec_ms.max(1.0);
                let remaining_ms = (deadline - now).num_milliseconds() as f64;
                if remaining_ms <= 0.0 {
                    self.max_deadline_boost
                } else if remaining_ms < window {
                    self.max_deadline_boost * (1.0 - remaining_ms / window)
                } else {
                    0.0
                }
            }
        };

        base + age_boost + deadline_boost
    }
}
