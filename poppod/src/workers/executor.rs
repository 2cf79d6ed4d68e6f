//! Executor seam - how a worker actually runs a task
//!
//! Production uses `CommandExecutor`, which spawns the configured external
//! AI CLI as a child process in the project directory. Tests substitute a
//! scripted implementation of the trait.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::queue::Task;

/// External executor invocation settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL on timeout
    pub kill_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["--print".to_string()],
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Everything a worker needs to run one task
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: Task,
    pub project_path: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Raw result of one executor invocation
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// The boundary between the pool and the external AI CLI
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError>;
}

/// Spawns the configured command once per task
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn render_prompt(task: &Task) -> String {
        match &task.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(Self::render_prompt(&request.task))
            .current_dir(&request.project_path)
            .env("POPPO_PROJECT_ID", &request.task.project_id)
            .env("POPPO_TASK_ID", &request.task.task_id)
            .env("POPPO_TASK_TYPE", &request.task.task_type)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(ExecutionError::Spawn)?;
        let pid = child.id();
        debug!(task_id = %request.task.task_id, ?pid, "Executor spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_to_string(stdout));
        let stderr_task = tokio::spawn(read_to_string(stderr));

        let status = tokio::select! {
            status = child.wait() => status.map_err(ExecutionError::Spawn)?,
            _ = tokio::time::sleep(request.timeout) => {
                warn!(task_id = %request.task.task_id, "Executor timed out, terminating");
                terminate(&mut child, pid, self.config.kill_grace).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecutionError::Timeout {
                    seconds: request.timeout.as_secs(),
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let exit_code = match status.code() {
            Some(code) => code,
            None => return Err(ExecutionError::Killed),
        };

        Ok(ExecutionOutput {
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }
}

async fn read_to_string(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf).await;
    }
    buf
}

/// SIGTERM, wait for the grace period, then SIGKILL
async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}
