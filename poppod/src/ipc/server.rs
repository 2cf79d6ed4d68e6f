//! IPC command dispatch
//!
//! The server owns no business logic: every command is a thin forward into
//! the owning component, and every reply is that component's result
//! serialized back onto the wire.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::error::DaemonError;
use crate::ipc::listener::{IpcListener, IpcStream, read_frame, write_frame};
use crate::ipc::messages::{EventFrame, Reply, Request, ServerFrame};
use crate::queue::{CancelOutcome, NewTask};
use crate::registry::{MoveOptions, ProjectFilter, ProjectPatch};
use crate::supervisor::{DaemonContext, ShutdownMode};

/// The IPC server; accepts clients until shutdown
pub struct IpcServer {
    ctx: Arc<DaemonContext>,
}

impl IpcServer {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, listener: IpcListener, mut shutdown: watch::Receiver<bool>) {
        info!("IPC server started");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(stream) => {
                            tokio::spawn(handle_connection(Arc::clone(&self.ctx), stream));
                        }
                        Err(e) => {
                            warn!(error = %e, "IPC accept failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        listener.cleanup();
        info!("IPC server stopped");
    }
}

async fn handle_connection(ctx: Arc<DaemonContext>, stream: IpcStream) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut subscribed = false;
    loop {
        match read_frame::<_, Request>(&mut read_half).await {
            Ok(Some(request)) => {
                if request.cmd == "subscribe" && !subscribed {
                    subscribed = true;
                    spawn_event_forwarder(&ctx, out_tx.clone());
                }
                let reply = dispatch(&ctx, request).await;
                if out_tx.send(ServerFrame::Reply(reply)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "IPC connection closed on error");
                break;
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

fn spawn_event_forwarder(ctx: &DaemonContext, out_tx: mpsc::Sender<ServerFrame>) {
    use tokio::sync::broadcast::error::RecvError;

    let mut events = ctx.bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                // A slow client loses old events rather than the stream
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
            let frame = ServerFrame::Event(EventFrame {
                event: event.name().to_string(),
                payload: payload.get("payload").cloned().unwrap_or(serde_json::Value::Null),
            });
            if out_tx.send(frame).await.is_err() {
                break;
            }
        }
    });
}

fn parse_args<T: DeserializeOwned>(args: &serde_json::Value) -> Result<T, DaemonError> {
    let value = if args.is_null() {
        serde_json::json!({})
    } else {
        args.clone()
    };
    serde_json::from_value(value).map_err(|e| DaemonError::InvalidArgs(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterArgs {
    path: PathBuf,
    #[serde(flatten)]
    patch: ProjectPatch,
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnregisterArgs {
    id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArgs {
    id: String,
    #[serde(flatten)]
    patch: ProjectPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveArgs {
    id: String,
    new_path: PathBuf,
    #[serde(flatten)]
    options: MoveOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdArgs {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteTaskArgs {
    task_id: String,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Deserialize)]
struct PauseArgs {
    #[serde(default = "default_pause_reason")]
    reason: String,
}

fn default_pause_reason() -> String {
    "operator".to_string()
}

#[derive(Deserialize)]
struct ClearArgs {
    #[serde(default)]
    priority: Option<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThrottleArgs {
    delay_ms: u64,
}

#[derive(Deserialize)]
struct ConcurrencyArgs {
    count: usize,
}

#[derive(Deserialize)]
struct ScaleArgs {
    target: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmergencyStopArgs {
    unlock_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ShutdownArgs {
    #[serde(default = "default_true")]
    graceful: bool,
}

fn default_true() -> bool {
    true
}

/// Commands that must be refused while the daemon is read-only
fn is_mutating(cmd: &str) -> bool {
    matches!(
        cmd,
        "register-project"
            | "unregister-project"
            | "update-project"
            | "enable-project"
            | "disable-project"
            | "move-project"
            | "queue-task"
    )
}

async fn dispatch(ctx: &DaemonContext, request: Request) -> Reply {
    let id = request.id;
    debug!(cmd = %request.cmd, id, "IPC command");

    if is_mutating(&request.cmd) && ctx.registry.is_read_only() {
        return Reply::from_error(id, &DaemonError::ReadOnly(request.cmd));
    }

    match execute(ctx, &request.cmd, &request.args).await {
        Ok(result) => Reply::success(id, result),
        Err(error) => Reply::from_error(id, &error),
    }
}

async fn execute(
    ctx: &DaemonContext,
    cmd: &str,
    args: &serde_json::Value,
) -> Result<serde_json::Value, DaemonError> {
    match cmd {
        "ping" => Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id(),
        })),

        "status" => {
            let uptime = (Utc::now() - ctx.started_at).num_seconds();
            Ok(serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "startedAt": ctx.started_at,
                "uptimeSecs": uptime,
                "readOnly": ctx.registry.is_read_only(),
                "projects": to_json(&ctx.registry.stats().await),
                "queue": to_json(&ctx.queue.status().await),
                "pool": to_json(&ctx.pool.status().await),
                "scheduler": to_json(&ctx.scheduler.status().await),
                "rateLimit": to_json(&ctx.limiter.utilization().await),
            }))
        }

        "reload" => {
            let config = GlobalConfig::load(&ctx.root)
                .map_err(|e| DaemonError::InvalidArgs(e.to_string()))?;
            *ctx.config.write().await = config;
            let invalid = ctx.registry.revalidate_all().await;
            info!(invalid, "Configuration reloaded");
            Ok(serde_json::json!({ "invalidProjects": invalid }))
        }

        "shutdown" => {
            let args: ShutdownArgs = parse_args(args)?;
            let mode = if args.graceful {
                ShutdownMode::Graceful
            } else {
                ShutdownMode::Immediate
            };
            ctx.shutdown_tx
                .send(mode)
                .await
                .map_err(|_| DaemonError::InvalidArgs("daemon is already stopping".into()))?;
            Ok(serde_json::json!({ "stopping": true }))
        }

        "register-project" => {
            let args: RegisterArgs = parse_args(args)?;
            let record = ctx.registry.register(args.path, args.patch).await?;
            Ok(to_json(&record))
        }

        "unregister-project" => {
            let args: UnregisterArgs = parse_args(args)?;
            let running = ctx.queue.running_count(&args.id).await;
            if running > 0 && !args.force {
                return Err(DaemonError::ProjectBusy {
                    project_id: args.id,
                    running,
                });
            }
            let record = ctx.registry.unregister(&args.id).await?;
            ctx.scheduler.forget_project(&args.id).await;
            Ok(to_json(&record))
        }

        "update-project" => {
            let args: UpdateArgs = parse_args(args)?;
            let record = ctx.registry.update(&args.id, args.patch).await?;
            Ok(to_json(&record))
        }

        "enable-project" => {
            let args: IdArgs = parse_args(args)?;
            ctx.registry.set_enabled(&args.id, true).await?;
            Ok(serde_json::json!({ "enabled": true }))
        }

        "disable-project" => {
            let args: IdArgs = parse_args(args)?;
            ctx.registry.set_enabled(&args.id, false).await?;
            Ok(serde_json::json!({ "enabled": false }))
        }

        "get-project-info" => {
            let args: IdArgs = parse_args(args)?;
            let record = ctx
                .registry
                .get(&args.id)
                .await
                .ok_or(DaemonError::ProjectNotFound(args.id.clone()))?;
            let trend = ctx.tracker.trend(&args.id).await;
            Ok(serde_json::json!({
                "project": to_json(&record),
                "healthTrend": to_json(&trend),
            }))
        }

        "validate-project" => {
            let args: IdArgs = parse_args(args)?;
            let report = ctx.registry.validate(&args.id).await?;
            Ok(to_json(&report))
        }

        "check-health" => {
            let args: IdArgs = parse_args(args)?;
            let record = ctx
                .tracker
                .check_project(&args.id)
                .await
                .ok_or(DaemonError::ProjectNotFound(args.id))?;
            Ok(to_json(&record))
        }

        "list-projects" => {
            let filter: ProjectFilter = parse_args(args)?;
            let projects = ctx.registry.list(&filter).await;
            Ok(to_json(&projects))
        }

        "move-project" => {
            let args: MoveArgs = parse_args(args)?;
            let running = ctx.queue.running_count(&args.id).await;
            ctx.registry
                .move_project(&args.id, args.new_path, args.options, running)
                .await?;
            let record = ctx
                .registry
                .get(&args.id)
                .await
                .ok_or(DaemonError::ProjectNotFound(args.id))?;
            Ok(to_json(&record))
        }

        "queue-task" => {
            let new_task: NewTask = parse_args(args)?;
            if ctx.registry.get(&new_task.project_id).await.is_none() {
                return Err(DaemonError::ProjectNotFound(new_task.project_id));
            }
            let task = ctx.queue.enqueue(new_task).await?;
            Ok(to_json(&task))
        }

        "cancel-task" => {
            let args: TaskIdArgs = parse_args(args)?;
            match ctx.queue.cancel(&args.task_id).await {
                CancelOutcome::CancelledQueued => Ok(serde_json::json!({ "cancelled": true })),
                CancelOutcome::Running(task) => Ok(serde_json::json!({
                    "cancelled": false,
                    "state": "running",
                    "projectId": task.project_id,
                })),
                CancelOutcome::NotFound => Err(DaemonError::TaskNotFound(args.task_id)),
            }
        }

        "get-queue-status" => Ok(to_json(&ctx.queue.status().await)),

        "complete-task" => {
            let args: CompleteTaskArgs = parse_args(args)?;
            let task = ctx.queue.complete(&args.task_id, args.duration_ms).await?;
            Ok(to_json(&task))
        }

        "pause-queue" => {
            let args: PauseArgs = parse_args(args)?;
            ctx.queue.pause(args.reason).await;
            Ok(serde_json::json!({ "paused": true }))
        }

        "resume-queue" => {
            ctx.queue.resume().await;
            Ok(serde_json::json!({ "paused": false }))
        }

        "clear-queue" => {
            let args: ClearArgs = parse_args(args)?;
            let removed = ctx.queue.clear(args.priority).await;
            Ok(serde_json::json!({ "removed": removed }))
        }

        "set-throttle" => {
            let args: ThrottleArgs = parse_args(args)?;
            ctx.limiter
                .set_throttle(std::time::Duration::from_millis(args.delay_ms))
                .await;
            Ok(serde_json::json!({ "delayMs": args.delay_ms }))
        }

        "set-concurrency" => {
            let args: ConcurrencyArgs = parse_args(args)?;
            if args.count == 0 {
                return Err(DaemonError::InvalidArgs("count must be at least 1".into()));
            }
            ctx.config.write().await.daemon.max_processes = args.count;
            Ok(serde_json::json!({ "maxProcesses": args.count }))
        }

        "scale-workers" => {
            let args: ScaleArgs = parse_args(args)?;
            let count = ctx.pool.scale_to(args.target).await;
            Ok(serde_json::json!({ "workers": count }))
        }

        "rate-limit-status" => Ok(to_json(&ctx.limiter.utilization().await)),

        "emergency-stop" => {
            let args: EmergencyStopArgs = parse_args(args)?;
            ctx.limiter.notify_rate_limit(args.unlock_at).await;
            Ok(serde_json::json!({ "unlockAt": args.unlock_at }))
        }

        "clear-session-invalid" => {
            ctx.limiter.clear_session_invalid().await;
            Ok(serde_json::json!({ "cleared": true }))
        }

        "subscribe" => Ok(serde_json::json!({ "subscribed": true })),

        other => Err(DaemonError::InvalidArgs(format!("unknown command: {other}"))),
    }
}
