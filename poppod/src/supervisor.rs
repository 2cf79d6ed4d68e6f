//! Daemon supervisor - lifecycle of all components
//!
//! Boot order: state store, registry, health tracker, rate-limit
//! coordinator, task queue, worker pool, scheduler, IPC; shutdown walks the
//! same order in reverse. One termination signal starts a graceful drain
//! with a 30-second deadline; a second one escalates to immediate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::events::EventBus;
use crate::health::{HealthTracker, HealthTrackerConfig};
use crate::ipc::{IpcListener, IpcServer, endpoint_for};
use crate::poller::{PollerSet, WorkSource};
use crate::queue::{QueueConfig, QueueSnapshot, TaskQueue};
use crate::ratelimit::{RateLimitConfig, RateLimitCoordinator};
use crate::registry::ProjectRegistry;
use crate::scheduler::{FairnessLedger, Scheduler, SchedulerConfig};
use crate::store::{StateKind, StateStore};
use crate::workers::{Executor, PoolConfig, WorkerPool};

/// How the daemon should come down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Wait for busy workers up to the deadline
    Graceful,
    /// Kill workers and re-queue their tasks
    Immediate,
}

/// Graceful-shutdown deadline before escalation
pub const GRACEFUL_DEADLINE: Duration = Duration::from_secs(30);

/// Shared handles to every component; the IPC server dispatches against this
pub struct DaemonContext {
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub config: Arc<RwLock<GlobalConfig>>,
    pub store: Arc<StateStore>,
    pub registry: Arc<ProjectRegistry>,
    pub queue: Arc<TaskQueue>,
    pub limiter: Arc<RateLimitCoordinator>,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<Scheduler>,
    pub tracker: Arc<HealthTracker>,
    pub bus: EventBus,
    pub shutdown_tx: mpsc::Sender<ShutdownMode>,
}

/// Owns the component tasks and the shutdown protocol
pub struct Supervisor {
    ctx: Arc<DaemonContext>,
    shutdown_rx: mpsc::Receiver<ShutdownMode>,
    cancel_tx: watch::Sender<bool>,
}

impl Supervisor {
    /// Boot every component and spawn its service task
    pub async fn start(
        root: PathBuf,
        config: GlobalConfig,
        executor: Arc<dyn Executor>,
        work_source: Arc<dyn WorkSource>,
    ) -> Result<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let bus = EventBus::default();

        // State store first: everything below persists through it
        let store = Arc::new(StateStore::open(&root).context("Failed to open state store")?);

        let registry = Arc::new(
            ProjectRegistry::open(Arc::clone(&store), bus.clone(), config.registry.max_projects)
                .await,
        );

        let tracker = Arc::new(HealthTracker::new(
            HealthTrackerConfig::default(),
            Arc::clone(&registry),
            bus.clone(),
        ));

        let limiter = Arc::new(
            RateLimitCoordinator::load(RateLimitConfig::default(), Arc::clone(&store), bus.clone())
                .await,
        );

        let queue = Arc::new(TaskQueue::new(
            QueueConfig {
                default_max_attempts: config.defaults.retry_attempts,
                ..Default::default()
            },
            bus.clone(),
        ));
        match store.load::<QueueSnapshot>(StateKind::QueueSnapshot).await {
            Ok(Some(snapshot)) => queue.restore(snapshot).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Queue snapshot unreadable, starting empty"),
        }

        let pool = WorkerPool::start(
            PoolConfig {
                max_workers: config.daemon.max_processes.max(1),
                task_timeout: Duration::from_millis(config.defaults.timeout),
                retry_delay: config.defaults.retry_delay_duration(),
                ..Default::default()
            },
            executor,
            Arc::clone(&queue),
            Arc::clone(&limiter),
            Arc::clone(&registry),
            bus.clone(),
            Arc::clone(&store),
        )
        .await;

        let shared_config = Arc::new(RwLock::new(config.clone()));
        let fairness = Arc::new(Mutex::new(FairnessLedger::default()));
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                strategy: config.daemon.scheduling_strategy,
                ..Default::default()
            },
            Arc::clone(&shared_config),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&limiter),
            Arc::clone(&pool),
            fairness,
        ));

        let pollers = Arc::new(PollerSet::new(
            work_source,
            Arc::clone(&registry),
            Arc::clone(&queue),
        ));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        let ctx = Arc::new(DaemonContext {
            started_at: Utc::now(),
            config: shared_config,
            store: Arc::clone(&store),
            registry,
            queue: Arc::clone(&queue),
            limiter,
            pool: Arc::clone(&pool),
            scheduler: Arc::clone(&scheduler),
            tracker: Arc::clone(&tracker),
            bus,
            shutdown_tx,
            root: root.clone(),
        });

        // Service tasks, boot order preserved
        tokio::spawn(tracker.run(cancel_rx.clone()));
        {
            let queue = Arc::clone(&queue);
            let cancel = cancel_rx.clone();
            tokio::spawn(async move { queue.run_aging(cancel).await });
        }
        tokio::spawn(snapshot_loop(queue, store, cancel_rx.clone()));
        tokio::spawn(pool.run(cancel_rx.clone()));
        tokio::spawn(scheduler.run(cancel_rx.clone()));
        tokio::spawn(pollers.run(cancel_rx.clone()));

        let (endpoint, port) = {
            let config = ctx.config.read().await;
            (
                endpoint_for(config.daemon.socket_path.as_deref(), &root),
                config.daemon.port,
            )
        };
        let listener = match IpcListener::bind(&endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, port, "Unix socket unavailable, falling back to loopback TCP");
                IpcListener::bind(&crate::ipc::IpcEndpoint::Tcp(port))
                    .await
                    .context("Failed to bind IPC listener")?
            }
        };
        tokio::spawn(IpcServer::new(Arc::clone(&ctx)).run(listener, cancel_rx));

        info!(root = %ctx.root.display(), "Daemon components started");
        Ok(Self {
            ctx,
            shutdown_rx,
            cancel_tx,
        })
    }

    pub fn context(&self) -> Arc<DaemonContext> {
        Arc::clone(&self.ctx)
    }

    /// Block on signals and IPC shutdown requests, then bring everything down
    #[cfg(unix)]
    pub async fn run(mut self) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP")?;

        let mode = loop {
            tokio::select! {
                _ = sigterm.recv() => break ShutdownMode::Graceful,
                _ = sigint.recv() => break ShutdownMode::Graceful,
                _ = sighup.recv() => {
                    self.reload().await;
                }
                request = self.shutdown_rx.recv() => {
                    break request.unwrap_or(ShutdownMode::Graceful);
                }
            }
        };

        // A second request of any kind during the graceful drain escalates
        let Self {
            ctx,
            mut shutdown_rx,
            cancel_tx,
        } = self;
        let escalate = async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
                _ = shutdown_rx.recv() => {}
            }
        };
        finish(ctx, cancel_tx, mode, escalate).await
    }

    /// Bring the daemon down without waiting for a signal (tests, embedding)
    pub async fn shutdown(self, mode: ShutdownMode) -> Result<()> {
        let Self { ctx, cancel_tx, .. } = self;
        finish(ctx, cancel_tx, mode, std::future::pending()).await
    }

    /// Reload configuration and re-validate the registry without touching
    /// running tasks
    pub async fn reload(&self) {
        match GlobalConfig::load(&self.ctx.root) {
            Ok(config) => {
                *self.ctx.config.write().await = config;
                let invalid = self.ctx.registry.revalidate_all().await;
                info!(invalid, "Configuration reloaded on SIGHUP");
            }
            Err(e) => warn!(error = %e, "Reload failed, keeping previous configuration"),
        }
    }

}

async fn finish(
    ctx: Arc<DaemonContext>,
    cancel_tx: watch::Sender<bool>,
    mode: ShutdownMode,
    escalate: impl std::future::Future<Output = ()>,
) -> Result<()> {
    info!(?mode, "Shutting down");
    // Stops the scheduler, pollers, health tracker, aging, and IPC
    let _ = cancel_tx.send(true);

    match mode {
        ShutdownMode::Graceful => {
            tokio::select! {
                _ = ctx.pool.shutdown(true, GRACEFUL_DEADLINE) => {}
                _ = escalate => {
                    warn!("Second shutdown request, escalating to immediate");
                    ctx.pool.shutdown(false, Duration::ZERO).await;
                }
            }
        }
        ShutdownMode::Immediate => {
            ctx.pool.shutdown(false, Duration::ZERO).await;
        }
    }

    // Final durable state: queue snapshot, then the registry document
    let snapshot = ctx.queue.snapshot().await;
    if let Err(e) = ctx.store.save(StateKind::QueueSnapshot, &snapshot).await {
        warn!(error = %e, "Final queue snapshot failed");
    }
    if let Err(e) = ctx.registry.flush().await {
        warn!(error = %e, "Final registry flush failed");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Persist the queue whenever it changes, with a short coalescing window
async fn snapshot_loop(
    queue: Arc<TaskQueue>,
    store: Arc<StateStore>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = queue.changed() => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
        }
        // Coalesce bursts of changes into one write
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = queue.snapshot().await;
        if let Err(e) = store.save(StateKind::QueueSnapshot, &snapshot).await {
            warn!(error = %e, "Queue snapshot failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::NullWorkSource;
    use crate::workers::{CommandExecutor, ExecutorConfig};
    use tempfile::TempDir;

    async fn start_supervisor(root: &std::path::Path) -> Supervisor {
        let config = GlobalConfig::default();
        Supervisor::start(
            root.to_path_buf(),
            config,
            Arc::new(CommandExecutor::new(ExecutorConfig::default())),
            Arc::new(NullWorkSource),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_boot_creates_state_layout() {
        let temp = TempDir::new().unwrap();
        let supervisor = start_supervisor(temp.path()).await;

        assert!(temp.path().join("projects").is_dir());
        assert!(temp.path().join("logs").is_dir());
        assert!(temp.path().join("poppod.sock").exists());

        let ctx = supervisor.context();
        assert!(!ctx.registry.is_read_only());
    }

    #[tokio::test]
    async fn test_shutdown_persists_queue_snapshot() {
        let temp = TempDir::new().unwrap();
        let supervisor = start_supervisor(temp.path()).await;
        let ctx = supervisor.context();

        ctx.queue
            .enqueue(crate::queue::NewTask {
                project_id: "ghost".into(),
                task_type: "issue".into(),
                payload: serde_json::Value::Null,
                priority: 50,
                deadline: None,
                max_attempts: None,
            })
            .await
            .unwrap();

        supervisor.shutdown(ShutdownMode::Immediate).await.unwrap();

        let store = StateStore::open(temp.path()).unwrap();
        let snapshot: Option<QueueSnapshot> =
            store.load(StateKind::QueueSnapshot).await.unwrap();
        assert_eq!(snapshot.unwrap().projects["ghost"].len(), 1);
    }

    #[tokio::test]
    async fn test_queue_restored_on_boot() {
        let temp = TempDir::new().unwrap();

        {
            let supervisor = start_supervisor(temp.path()).await;
            let ctx = supervisor.context();
            for _ in 0..5 {
                ctx.queue
                    .enqueue(crate::queue::NewTask {
                        project_id: "p".into(),
                        task_type: "issue".into(),
                        payload: serde_json::Value::Null,
                        priority: 50,
                        deadline: None,
                        max_attempts: None,
                    })
                    .await
                    .unwrap();
            }
            // Give the change-driven snapshot a moment to land, mimicking a
            // daemon that is killed without any shutdown path
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let supervisor = start_supervisor(temp.path()).await;
        assert_eq!(supervisor.context().queue.total_queued().await, 5);
    }

    #[tokio::test]
    async fn test_ipc_commands_round_trip() {
        let temp = TempDir::new().unwrap();
        let _supervisor = start_supervisor(temp.path()).await;
        let client = crate::ipc::DaemonClient::new(temp.path().join("poppod.sock"));

        let version = client.ping().await.unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));

        let project_dir = temp.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();
        let record = client
            .request(
                "register-project",
                serde_json::json!({ "path": project_dir, "priority": 70 }),
            )
            .await
            .unwrap();
        assert_eq!(record["priority"], 70);

        let listed = client
            .request("list-projects", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let status = client.status().await.unwrap();
        assert_eq!(status["projects"]["total"], 1);
        assert_eq!(status["readOnly"], false);

        let err = client
            .request("frobnicate", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid-args"));
    }

    #[tokio::test]
    async fn test_ipc_shutdown_request_reaches_supervisor() {
        let temp = TempDir::new().unwrap();
        let mut supervisor = start_supervisor(temp.path()).await;
        let ctx = supervisor.context();

        ctx.shutdown_tx.send(ShutdownMode::Graceful).await.unwrap();
        let mode = supervisor.shutdown_rx.recv().await.unwrap();
        assert_eq!(mode, ShutdownMode::Graceful);
    }
}
