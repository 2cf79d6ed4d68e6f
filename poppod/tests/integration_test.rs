//! End-to-end tests for the daemon's orchestration engine
//!
//! These drive the scheduler tick-by-tick against real components and a
//! scripted executor, so dispatch ordering and quota behavior are
//! deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::{Mutex, RwLock, watch};

use poppod::config::{GlobalConfig, SchedulingStrategy};
use poppod::events::EventBus;
use poppod::queue::{NewTask, QueueConfig, TaskQueue};
use poppod::ratelimit::{RateLimitConfig, RateLimitCoordinator};
use poppod::registry::{ProjectPatch, ProjectRegistry, ProjectResources};
use poppod::scheduler::{FairnessLedger, Scheduler, SchedulerConfig};
use poppod::store::StateStore;
use poppod::workers::{
    ExecutionOutput, ExecutionRequest, Executor, PoolConfig, WorkerPool,
};

/// What the scripted executor should do for one invocation
#[derive(Clone)]
enum Step {
    Ok { delay: Duration },
    RateLimit { unlock_in: Duration },
    Stderr { text: String },
}

/// Executor that follows a script and records the order of invocations
struct ScriptedExecutor {
    script: Mutex<Vec<Step>>,
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            started: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        })
    }

    async fn started_tasks(&self) -> Vec<String> {
        self.started.lock().await.clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutput, poppod::ExecutionError> {
        self.started.lock().await.push(request.task.task_id.clone());
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now_running, Ordering::SeqCst);

        let step = {
            let mut script = self.script.lock().await;
            if script.is_empty() {
                Step::Ok {
                    delay: Duration::from_millis(5),
                }
            } else {
                script.remove(0)
            }
        };

        let result = match step {
            Step::Ok { delay } => {
                tokio::time::sleep(delay).await;
                Ok(ExecutionOutput {
                    exit_code: 0,
                    stdout: "done".into(),
                    stderr: String::new(),
                    duration: delay,
                })
            }
            Step::RateLimit { unlock_in } => {
                let unlock_epoch = (Utc::now() + chrono::Duration::from_std(unlock_in).unwrap()).timestamp();
                Ok(ExecutionOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("usage limit reached|{unlock_epoch}"),
                    duration: Duration::from_millis(1),
                })
            }
            Step::Stderr { text } => Ok(ExecutionOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: text,
                duration: Duration::from_millis(1),
            }),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Daemon {
    registry: Arc<ProjectRegistry>,
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimitCoordinator>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    bus: EventBus,
    _temp: TempDir,
    _shutdown_tx: watch::Sender<bool>,
}

async fn daemon(executor: Arc<ScriptedExecutor>, strategy: SchedulingStrategy, workers: usize) -> Daemon {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(temp.path().join("state")).unwrap());
    let bus = EventBus::default();

    let registry = Arc::new(ProjectRegistry::open(Arc::clone(&store), bus.clone(), 20).await);
    let queue = Arc::new(TaskQueue::new(QueueConfig::default(), bus.clone()));
    let limiter = Arc::new(
        RateLimitCoordinator::load(
            RateLimitConfig {
                requests_per_minute: 10_000,
                tokens_per_minute: 100_000_000,
                max_recovery_jitter: Duration::ZERO,
                ..Default::default()
            },
            Arc::clone(&store),
            bus.clone(),
        )
        .await,
    );

    let pool = WorkerPool::start(
        PoolConfig {
            min_workers: workers,
            max_workers: workers,
            ..Default::default()
        },
        executor,
        Arc::clone(&queue),
        Arc::clone(&limiter),
        Arc::clone(&registry),
        bus.clone(),
        store,
    )
    .await;

    let mut config = GlobalConfig::default();
    config.daemon.max_processes = workers;
    config.daemon.scheduling_strategy = strategy;
    let shared = Arc::new(RwLock::new(config));

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            strategy,
            ..Default::default()
        },
        shared,
        Arc::clone(&registry),
        Arc::clone(&queue),
        Arc::clone(&limiter),
        Arc::clone(&pool),
        Arc::new(Mutex::new(FairnessLedger::default())),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&pool).run(shutdown_rx));

    Daemon {
        registry,
        queue,
        limiter,
        pool,
        scheduler,
        bus,
        _temp: temp,
        _shutdown_tx: shutdown_tx,
    }
}

impl Daemon {
    async fn register_project(&self, name: &str, patch: ProjectPatch) -> String {
        let dir = self._temp.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        self.registry.register(dir, patch).await.unwrap().id
    }

    async fn enqueue(&self, project_id: &str, priority: u8) -> String {
        self.queue
            .enqueue(NewTask {
                project_id: project_id.into(),
                task_type: "issue".into(),
                payload: serde_json::Value::String("work".into()),
                priority,
                deadline: None,
                max_attempts: None,
            })
            .await
            .unwrap()
            .task_id
    }

    /// Drive scheduler ticks until nothing is queued or running, or timeout
    async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.scheduler.tick().await;
            if self.queue.total_queued().await == 0 && self.queue.total_running().await == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn test_registration_and_dispatch_order() {
    let executor = ScriptedExecutor::new(vec![]);
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::WeightedRoundRobin, 2).await;

    let project = d
        .register_project(
            "alpha",
            ProjectPatch {
                priority: Some(50),
                weight: Some(1.0),
                resources: Some(ProjectResources {
                    max_concurrent: 2,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await;

    let t1 = d.enqueue(&project, 10).await;
    let t2 = d.enqueue(&project, 50).await;
    let t3 = d.enqueue(&project, 30).await;

    d.drain(Duration::from_secs(5)).await;

    let started = executor.started_tasks().await;
    assert_eq!(started, vec![t2, t3, t1], "dispatch follows effective priority");
    assert!(
        executor.peak_running.load(Ordering::SeqCst) <= 2,
        "never more than maxConcurrent running"
    );

    let record = d.registry.get(&project).await.unwrap();
    assert_eq!(record.stats.total_processed, 3);
}

#[tokio::test]
async fn test_max_concurrent_is_respected_under_load() {
    let executor = ScriptedExecutor::new(
        (0..6)
            .map(|_| Step::Ok {
                delay: Duration::from_millis(100),
            })
            .collect(),
    );
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::WeightedRoundRobin, 2).await;

    let project = d
        .register_project(
            "loaded",
            ProjectPatch {
                resources: Some(ProjectResources {
                    max_concurrent: 2,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await;

    for _ in 0..6 {
        d.enqueue(&project, 50).await;
    }
    d.drain(Duration::from_secs(10)).await;

    assert!(executor.peak_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(executor.started_tasks().await.len(), 6);
}

#[tokio::test]
async fn test_rate_limit_stops_all_dispatch_then_recovers() {
    let executor = ScriptedExecutor::new(vec![Step::RateLimit {
        unlock_in: Duration::from_millis(800),
    }]);
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::WeightedRoundRobin, 2).await;

    let a = d.register_project("proj-a", ProjectPatch::default()).await;
    let b = d.register_project("proj-b", ProjectPatch::default()).await;
    for _ in 0..5 {
        d.enqueue(&a, 50).await;
        d.enqueue(&b, 50).await;
    }

    // First dispatch trips the lockout
    let mut events = d.bus.subscribe();
    while !d.limiter.emergency_active().await {
        d.scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let dispatched_before = executor.started_tasks().await.len();

    // While stopped, ticks must not move any task to running
    for _ in 0..20 {
        assert!(d.scheduler.tick().await.is_none());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(executor.started_tasks().await.len(), dispatched_before);

    // After the unlock time, work resumes and both projects drain evenly.
    // Eleven invocations total: ten tasks plus the re-run of the one the
    // lockout interrupted.
    d.drain(Duration::from_secs(10)).await;
    assert!(!d.limiter.emergency_active().await);
    assert_eq!(executor.started_tasks().await.len(), 11);
    assert_eq!(d.pool.status().await.busy, 0);

    let mut saw_stop = false;
    let mut saw_clear = false;
    while let Ok(event) = events.try_recv() {
        match event.name() {
            "emergency-stop" => saw_stop = true,
            "emergency-clear" => saw_clear = true,
            _ => {}
        }
    }
    assert!(saw_stop && saw_clear);

    // 1:1 fairness within tolerance: eleven dispatches split across two
    // equal-weight projects
    let status = d.scheduler.status().await;
    let shares: HashMap<String, usize> = status.fairness.shares;
    assert_eq!(shares.get(&a).copied().unwrap_or(0) + shares.get(&b).copied().unwrap_or(0), 11);
    assert!(shares[&a] >= 4 && shares[&b] >= 4);
}

#[tokio::test]
async fn test_weighted_fairness_converges() {
    let executor = ScriptedExecutor::new(vec![]);
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::WeightedRoundRobin, 1).await;

    let a = d
        .register_project(
            "light",
            ProjectPatch {
                weight: Some(1.0),
                resources: Some(ProjectResources {
                    max_concurrent: 1,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await;
    let b = d
        .register_project(
            "heavy",
            ProjectPatch {
                weight: Some(3.0),
                resources: Some(ProjectResources {
                    max_concurrent: 1,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await;

    // Effectively infinite supply relative to the dispatch budget
    for _ in 0..100 {
        d.enqueue(&a, 50).await;
        d.enqueue(&b, 50).await;
    }

    let mut dispatches = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while dispatches < 80 && tokio::time::Instant::now() < deadline {
        if d.scheduler.tick().await.is_some() {
            dispatches += 1;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let shares = d.scheduler.status().await.fairness.shares;
    let a_share = shares.get(&a).copied().unwrap_or(0) as f64;
    let b_share = shares.get(&b).copied().unwrap_or(0) as f64;
    let total = a_share + b_share;
    assert!(total >= 80.0, "expected at least 80 dispatches, got {total}");
    // Weight ratio 1:3 within ten percent of total
    assert!(
        (a_share / total - 0.25).abs() < 0.10,
        "light project share {a_share}/{total}"
    );

    // Jain's index for weights (1,3): (1+3)^2 / (2*(1+9)) = 0.8
    let index = d.scheduler.status().await.fairness.index;
    assert!((index - 0.8).abs() < 0.08, "fairness index {index}");
}

#[tokio::test]
async fn test_session_invalid_halts_until_cleared() {
    let executor = ScriptedExecutor::new(vec![Step::Stderr {
        text: "Invalid API key. Please run /login".into(),
    }]);
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::WeightedRoundRobin, 2).await;
    let mut events = d.bus.subscribe();

    let a = d.register_project("one", ProjectPatch::default()).await;
    let b = d.register_project("two", ProjectPatch::default()).await;
    for _ in 0..3 {
        d.enqueue(&a, 50).await;
        d.enqueue(&b, 50).await;
    }

    while !d.limiter.session_invalid().await {
        d.scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let dispatched_before = executor.started_tasks().await.len();

    // Dispatch is halted for every project
    for _ in 0..10 {
        assert!(d.scheduler.tick().await.is_none());
    }
    assert_eq!(executor.started_tasks().await.len(), dispatched_before);

    // The event fires exactly once
    let mut session_invalid_count = 0;
    while let Ok(event) = events.try_recv() {
        if event.name() == "session-invalid" {
            session_invalid_count += 1;
        }
    }
    assert_eq!(session_invalid_count, 1);

    // Operator clears; everything drains. Seven invocations: six tasks plus
    // the re-run of the one the expired session interrupted.
    d.limiter.clear_session_invalid().await;
    d.drain(Duration::from_secs(10)).await;
    assert_eq!(executor.started_tasks().await.len(), 7);
}

#[tokio::test]
async fn test_disabled_project_is_never_dispatched() {
    let executor = ScriptedExecutor::new(vec![]);
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::WeightedRoundRobin, 2).await;

    let project = d.register_project("dormant", ProjectPatch::default()).await;
    d.enqueue(&project, 50).await;
    d.registry.set_enabled(&project, false).await.unwrap();

    for _ in 0..10 {
        assert!(d.scheduler.tick().await.is_none());
    }
    assert_eq!(executor.started_tasks().await.len(), 0);
    assert_eq!(d.queue.queued_count(&project).await, 1);
}

#[tokio::test]
async fn test_paused_queue_blocks_dispatch() {
    let executor = ScriptedExecutor::new(vec![]);
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::WeightedRoundRobin, 2).await;

    let project = d.register_project("pausable", ProjectPatch::default()).await;
    d.enqueue(&project, 50).await;

    d.queue.pause("maintenance".into()).await;
    for _ in 0..5 {
        assert!(d.scheduler.tick().await.is_none());
    }

    d.queue.resume().await;
    d.drain(Duration::from_secs(5)).await;
    assert_eq!(executor.started_tasks().await.len(), 1);
}

#[tokio::test]
async fn test_round_robin_rotates_between_projects() {
    let executor = ScriptedExecutor::new(vec![]);
    let d = daemon(Arc::clone(&executor), SchedulingStrategy::RoundRobin, 1).await;

    let a = d.register_project("aaa", ProjectPatch::default()).await;
    let b = d.register_project("bbb", ProjectPatch::default()).await;
    for _ in 0..4 {
        d.enqueue(&a, 50).await;
        d.enqueue(&b, 50).await;
    }

    let mut order = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while order.len() < 8 && tokio::time::Instant::now() < deadline {
        if let Some(project) = d.scheduler.tick().await {
            order.push(project);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(order.len(), 8);
    // Strict alternation once both projects are in rotation
    for pair in order.windows(2) {
        assert_ne!(pair[0], pair[1], "round robin must alternate: {order:?}");
    }
}
