//! Global daemon configuration
//!
//! Loaded from `<root>/config.json` where `<root>` defaults to
//! `~/.poppobuilder` and can be overridden with `POPPO_CONFIG_DIR`.
//! Every key has a default so a missing or partial file is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration root directory
pub const CONFIG_DIR_ENV: &str = "POPPO_CONFIG_DIR";

/// Environment variable overriding the configured language
pub const LANG_ENV: &str = "POPPOBUILDER_LANG";

/// Resolve the configuration root directory
pub fn config_root() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".poppobuilder")
}

/// Scheduling strategy selection, mapped from `daemon.schedulingStrategy`
///
/// Unknown strategy strings fail deserialization, which fails config load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingStrategy {
    RoundRobin,
    Priority,
    /// Alias kept for older config files; behaves as weighted-round-robin
    Weighted,
    #[default]
    WeightedRoundRobin,
    DeadlineAware,
}

/// Main daemon configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalConfig {
    pub version: u32,
    pub daemon: DaemonConfig,
    pub resources: ResourceConfig,
    pub defaults: TaskDefaults,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            version: 1,
            daemon: DaemonConfig::default(),
            resources: ResourceConfig::default(),
            defaults: TaskDefaults::default(),
            registry: RegistryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Daemon process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    pub enabled: bool,
    /// Loopback TCP port used when no socket path is available
    pub port: u16,
    /// Unix-domain socket path; defaults to `<root>/poppod.sock`
    pub socket_path: Option<PathBuf>,
    /// Global cap on concurrently running tasks
    pub max_processes: usize,
    pub scheduling_strategy: SchedulingStrategy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3003,
            socket_path: None,
            max_processes: 2,
            scheduling_strategy: SchedulingStrategy::WeightedRoundRobin,
        }
    }
}

/// Host resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceConfig {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u8,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 4096,
            max_cpu_percent: 80,
        }
    }
}

/// Per-task defaults applied when a project or task does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskDefaults {
    /// Milliseconds between project polls
    pub polling_interval: u64,
    /// Per-task execution timeout in milliseconds
    pub timeout: u64,
    pub retry_attempts: u32,
    /// Milliseconds between retries of transient failures
    pub retry_delay: u64,
    pub language: String,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            polling_interval: 300_000,
            timeout: 600_000,
            retry_attempts: 3,
            retry_delay: 5_000,
            language: "en".to_string(),
        }
    }
}

impl TaskDefaults {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

/// Registry limits and discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    pub max_projects: usize,
    pub auto_discovery: bool,
    pub discovery_paths: Vec<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_projects: 20,
            auto_discovery: false,
            discovery_paths: Vec::new(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub directory: PathBuf,
    pub max_files: usize,
    pub max_size_mb: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: PathBuf::from("logs"),
            max_files: 30,
            max_size_mb: 10,
        }
    }
}

impl GlobalConfig {
    /// Load configuration from `<root>/config.json`, falling back to defaults
    /// when the file does not exist. A present-but-unreadable file is an error.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.json");
        if !path.exists() {
            tracing::info!("No config file found, using defaults");
            return Ok(Self::default().with_env_overrides());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;

        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config.with_env_overrides())
    }

    /// Write the configuration document to `<root>/config.json`
    pub fn save(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root).context("Failed to create config root")?;
        let path = root.join("config.json");
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(lang) = std::env::var(LANG_ENV)
            && !lang.is_empty()
        {
            self.defaults.language = lang;
        }
        self
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.daemon.max_processes == 0 {
            eyre::bail!("daemon.maxProcesses must be at least 1");
        }
        if self.defaults.polling_interval < 60_000 {
            eyre::bail!("defaults.pollingInterval must be at least 60000 ms");
        }
        if self.registry.max_projects == 0 {
            eyre::bail!("registry.maxProjects must be at least 1");
        }
        if self.resources.max_cpu_percent > 100 {
            eyre::bail!("resources.maxCpuPercent must be at most 100");
        }
        Ok(())
    }

    /// Effective socket path for the IPC listener
    pub fn socket_path(&self, root: &Path) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(|| root.join("poppod.sock"))
    }
}
