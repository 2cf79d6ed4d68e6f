//! PoppoBuilder daemon - binary entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use poppod::cli::{Cli, Command, OutputFormat};
use poppod::config::{GlobalConfig, config_root};
use poppod::daemon::DaemonManager;
use poppod::ipc::DaemonClient;
use poppod::poller::NullWorkSource;
use poppod::supervisor::Supervisor;
use poppod::workers::{CommandExecutor, ExecutorConfig};

fn setup_logging(verbose: bool, configured_level: Option<&str>) {
    let default_level = if verbose {
        "debug"
    } else {
        configured_level.unwrap_or("info")
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.config_dir.clone().unwrap_or_else(config_root);

    // The configured log level applies unless --verbose or RUST_LOG override
    let configured_level = GlobalConfig::load(&root).ok().map(|c| c.logging.level);
    setup_logging(cli.verbose, configured_level.as_deref());

    match cli.command {
        Some(Command::Start { foreground }) => {
            if foreground {
                run_daemon(root).await
            } else {
                let manager = DaemonManager::new(&root);
                let pid = manager.start()?;
                println!("Daemon started (pid {pid})");
                Ok(())
            }
        }
        Some(Command::Stop) => {
            DaemonManager::new(&root).stop()?;
            println!("Daemon stopped");
            Ok(())
        }
        Some(Command::Status { format }) => status(root, format).await,
        Some(Command::RunDaemon) => run_daemon(root).await,
        None => {
            println!("poppod v{}", env!("CARGO_PKG_VERSION"));
            println!("  config root: {}", root.display());
            println!("  run `poppod start` to launch the daemon, `poppod --help` for commands");
            Ok(())
        }
    }
}

async fn run_daemon(root: PathBuf) -> Result<()> {
    let mut manager = DaemonManager::new(&root);
    manager.register_self()?;

    let config = GlobalConfig::load(&root).context("Failed to load configuration")?;
    info!(root = %root.display(), "Starting daemon");

    let supervisor = Supervisor::start(
        root,
        config,
        Arc::new(CommandExecutor::new(ExecutorConfig::default())),
        Arc::new(NullWorkSource),
    )
    .await?;

    let result = supervisor.run().await;
    manager.release();
    result
}

async fn status(root: PathBuf, format: OutputFormat) -> Result<()> {
    let manager = DaemonManager::new(&root);
    let Some(pid) = manager.running_pid() else {
        match format {
            OutputFormat::Json => println!("{}", serde_json::json!({ "running": false })),
            OutputFormat::Text => println!("Daemon is not running"),
        }
        return Ok(());
    };

    let config = GlobalConfig::load(&root)?;
    let client = DaemonClient::new(config.socket_path(&root));
    let status = client.status().await.context("Daemon did not answer on IPC")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => {
            println!("Daemon running (pid {pid})");
            if let Some(version) = status.get("version").and_then(|v| v.as_str()) {
                println!("  version: {version}");
            }
            if let Some(uptime) = status.get("uptimeSecs").and_then(|v| v.as_i64()) {
                println!("  uptime: {uptime}s");
            }
            if let Some(projects) = status.get("projects") {
                println!(
                    "  projects: {} ({} enabled)",
                    projects.get("total").and_then(|v| v.as_u64()).unwrap_or(0),
                    projects.get("enabled").and_then(|v| v.as_u64()).unwrap_or(0),
                );
            }
            if let Some(queue) = status.get("queue") {
                println!(
                    "  queue: {} queued, {} running",
                    queue.get("totalQueued").and_then(|v| v.as_u64()).unwrap_or(0),
                    queue.get("running").and_then(|v| v.as_u64()).unwrap_or(0),
                );
            }
        }
    }
    Ok(())
}
