//! IPC client used by the daemon-control CLI
//!
//! Connects per request; the daemon serializes command handling internally,
//! so a short-lived connection per command keeps the client trivial.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{Context, Result, eyre};
use tokio::net::UnixStream;

use super::listener::{IpcStream, read_frame, write_frame};
use super::messages::{Reply, Request};

/// Client for the daemon's command channel
pub struct DaemonClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            next_id: AtomicU64::new(1),
        }
    }

    /// Send one command and wait for its reply
    pub async fn request(&self, cmd: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Failed to connect to {}", self.socket_path.display()))?;
        let mut stream = IpcStream::Unix(stream);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        write_frame(
            &mut stream,
            &Request {
                cmd: cmd.to_string(),
                id,
                args,
            },
        )
        .await?;

        let reply: Reply = read_frame(&mut stream)
            .await?
            .ok_or_else(|| eyre!("daemon closed the connection"))?;

        if reply.id != id {
            return Err(eyre!("reply id mismatch: sent {id}, got {}", reply.id));
        }
        if reply.ok {
            Ok(reply.result.unwrap_or(serde_json::Value::Null))
        } else {
            let error = reply.error.unwrap_or_else(|| super::messages::ErrorBody {
                code: "unknown".into(),
                message: "daemon returned failure without detail".into(),
            });
            Err(eyre!("{} ({})", error.message, error.code))
        }
    }

    /// Liveness probe; returns the daemon version
    pub async fn ping(&self) -> Result<String> {
        let result = self.request("ping", serde_json::Value::Null).await?;
        Ok(result
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    /// Full daemon status document
    pub async fn status(&self) -> Result<serde_json::Value> {
        self.request("status", serde_json::Value::Null).await
    }

    /// Ask the daemon to stop
    pub async fn shutdown(&self, graceful: bool) -> Result<()> {
        self.request("shutdown", serde_json::json!({ "graceful": graceful }))
            .await?;
        Ok(())
    }
}
