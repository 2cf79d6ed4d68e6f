//! Daemon-control command definitions
//!
//! The project-management CLI and the dashboard are separate front-ends
//! speaking the IPC protocol; this binary only starts, stops, and inspects
//! the daemon itself.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// PoppoBuilder daemon - multi-project GitHub issue orchestration
#[derive(Parser)]
#[command(
    name = "poppod",
    about = "Orchestrates automated GitHub issue processing across projects",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Configuration root (overrides POPPO_CONFIG_DIR and ~/.poppobuilder)
    #[arg(short, long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon in the background
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Internal: run as the daemon process (used by `start`)
    #[command(hide = true)]
    RunDaemon,
}

/// Output format for status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {s}. Use: text or json")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_no_command() {
        let cli = Cli::parse_from(["poppod"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_start() {
        let cli = Cli::parse_from(["poppod", "start"]);
        assert!(matches!(cli.command, Some(Command::Start { foreground: false })));

        let cli = Cli::parse_from(["poppod", "start", "--foreground"]);
        assert!(matches!(cli.command, Some(Command::Start { foreground: true })));
    }

    #[test]
    fn test_parse_stop_and_status() {
        let cli = Cli::parse_from(["poppod", "stop"]);
        assert!(matches!(cli.command, Some(Command::Stop)));

        let cli = Cli::parse_from(["poppod", "status", "--format", "json"]);
        match cli.command {
            Some(Command::Status { format }) => assert_eq!(format, OutputFormat::Json),
            _ => panic!("expected Status"),
        }
    }

    #[test]
    fn test_parse_config_dir() {
        let cli = Cli::parse_from(["poppod", "-c", "/srv/poppo", "status"]);
        assert_eq!(cli.config_dir, Some(PathBuf::from("/srv/poppo")));
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
