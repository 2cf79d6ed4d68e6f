//! Daemon process management
//!
//! PID-file ownership, liveness probes, and start/stop of the background
//! process. The PID file doubles as an exclusive lock so a second daemon
//! instance refuses to start even after an unclean exit left a stale file.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info, warn};

/// Manages the daemon's PID/lock file
#[derive(Debug)]
pub struct DaemonManager {
    root: PathBuf,
    pid_file: PathBuf,
    /// Held for the daemon's lifetime; dropping releases the lock
    lock: Option<fs::File>,
}

impl DaemonManager {
    /// Manager for a PID file under the given state root
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            root: root.to_path_buf(),
            pid_file: root.join("poppod.pid"),
            lock: None,
        }
    }

    /// Whether a daemon currently owns the PID file
    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_running)
    }

    /// The running daemon's PID, if any
    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        if !self.pid_file.exists() {
            return None;
        }
        let mut file = fs::File::open(&self.pid_file).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    /// Claim the PID file for this process.
    ///
    /// Takes an exclusive flock and writes our PID. Fails when another live
    /// process holds the lock; a stale file from a dead process is reclaimed.
    pub fn register_self(&mut self) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.pid_file)
            .context("Failed to open PID file")?;

        file.try_lock_exclusive().map_err(|_| {
            let holder = self.read_pid().unwrap_or(0);
            eyre::eyre!("Another daemon instance is running (pid {holder})")
        })?;

        file.set_len(0).context("Failed to truncate PID file")?;
        write!(file, "{}", std::process::id()).context("Failed to write PID")?;
        file.sync_all().context("Failed to sync PID file")?;

        info!(pid = std::process::id(), path = %self.pid_file.display(), "PID file claimed");
        self.lock = Some(file);
        Ok(())
    }

    /// Release the lock and remove the PID file
    pub fn release(&mut self) {
        self.lock = None;
        if self.pid_file.exists()
            && let Err(e) = fs::remove_file(&self.pid_file)
        {
            warn!(error = %e, "Failed to remove PID file");
        }
    }

    /// Spawn the daemon as a detached background process
    pub fn start(&self) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {pid}"));
        }

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        debug!(exe = %exe.display(), "Spawning daemon process");

        let child = Command::new(&exe)
            .arg("run-daemon")
            .env(crate::config::CONFIG_DIR_ENV, &self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Stop the running daemon: SIGTERM, wait, then SIGKILL
    pub fn stop(&self) -> Result<()> {
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon");
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;
        }

        let mut attempts = 0;
        while is_process_running(pid) && attempts < 350 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }

        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        info!(pid, "Daemon stopped");
        Ok(())
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }
}

/// Signal 0 probes process existence without affecting it
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
