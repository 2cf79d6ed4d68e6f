//! Daemon error taxonomy
//!
//! Typed errors drive the retry-vs-surface-vs-fatal decision in the worker
//! pool and the IPC surface. Plumbing code uses `eyre::Result` instead.

use thiserror::Error;

/// Errors surfaced by the registry, queue, and IPC layers
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Per-project or global queue capacity reached
    #[error("queue full for project {project_id} ({limit} tasks)")]
    QueueFull { project_id: String, limit: usize },

    /// Registry project cap reached
    #[error("registry full ({limit} projects)")]
    RegistryFull { limit: usize },

    /// Project lookup failed
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// A project with the same id or path is already registered
    #[error("project already registered: {0}")]
    DuplicateProject(String),

    /// Task lookup failed
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Bad input on the IPC surface or in a config patch
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A persisted document could not be read or failed validation
    #[error("state corrupt: {0}")]
    StateCorrupt(String),

    /// Mutating command refused while the daemon is in read-only mode
    #[error("daemon is read-only: {0}")]
    ReadOnly(String),

    /// A project cannot be moved while it has running tasks
    #[error("project {project_id} has {running} running task(s)")]
    ProjectBusy { project_id: String, running: usize },

    /// A move transaction failed and could not be rolled back
    #[error("move failed for {project_id}, project marked needs-recovery: {detail}")]
    MoveFailed { project_id: String, detail: String },

    /// Filesystem operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaemonError {
    /// Stable machine-readable code for the IPC error frame
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue-full",
            Self::RegistryFull { .. } => "registry-full",
            Self::ProjectNotFound(_) => "project-not-found",
            Self::DuplicateProject(_) => "duplicate-project",
            Self::TaskNotFound(_) => "task-not-found",
            Self::InvalidArgs(_) => "invalid-args",
            Self::StateCorrupt(_) => "state-corrupt",
            Self::ReadOnly(_) => "read-only",
            Self::ProjectBusy { .. } => "project-busy",
            Self::MoveFailed { .. } => "move-failed",
            Self::Io(_) => "io-error",
            Self::Json(_) => "serialization-error",
        }
    }
}

/// Failures of a single executor invocation
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The executor process could not be spawned
    #[error("failed to spawn executor: {0}")]
    Spawn(std::io::Error),

    /// The task exceeded its deadline and the process was killed
    #[error("executor timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The executor process was terminated by a signal
    #[error("executor killed by signal")]
    Killed,
}
