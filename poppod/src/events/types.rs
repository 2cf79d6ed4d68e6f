//! Event types published on the daemon bus

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Every significant state change in the daemon emits one of these.
///
/// Events are one-way notifications; coordination between components happens
/// through idempotent handlers, never through event replies.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum DaemonEvent {
    ProjectRegistered {
        project_id: String,
        path: String,
    },
    ProjectUpdated {
        project_id: String,
    },
    ProjectUnregistered {
        project_id: String,
    },

    TaskQueued {
        task_id: String,
        project_id: String,
    },
    TaskStarted {
        task_id: String,
        project_id: String,
    },
    TaskCompleted {
        task_id: String,
        project_id: String,
    },
    TaskFailed {
        task_id: String,
        project_id: String,
        reason: String,
    },

    QueuePaused {
        reason: String,
    },
    QueueResumed,

    EmergencyStop {
        reason: String,
        unlock_at: DateTime<Utc>,
    },
    EmergencyClear,
    SessionInvalid,
    SessionCleared,

    HealthAlert {
        project_id: String,
        detail: String,
    },

    PoolUnstable {
        consecutive_crashes: u32,
    },
    StateCorrupt {
        detail: String,
    },
}

impl DaemonEvent {
    /// Kebab-case event name, matching the serialized `event` tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProjectRegistered { .. } => "project-registered",
            Self::ProjectUpdated { .. } => "project-updated",
            Self::ProjectUnregistered { .. } => "project-unregistered",
            Self::TaskQueued { .. } => "task-queued",
            Self::TaskStarted { .. } => "task-started",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
            Self::QueuePaused { .. } => "queue-paused",
            Self::QueueResumed => "queue-resumed",
            Self::EmergencyStop { .. } => "emergency-stop",
            Self::EmergencyClear => "emergency-clear",
            Self::SessionInvalid => "session-invalid",
            Self::SessionCleared => "session-cleared",
            Self::HealthAlert { .. } => "health-alert",
            Self::PoolUnstable { .. } => "pool-unstable",
            Self::StateCorrupt { .. } => "state-corrupt",
        }
    }
}
