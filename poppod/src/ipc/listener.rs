//! IPC transport: listener, stream, and frame codec
//!
//! Frames are a u32 big-endian byte length followed by that many bytes of
//! JSON. The listener binds a Unix-domain socket by default and falls back
//! to loopback TCP when the daemon is configured without a socket path.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use eyre::{Context as _, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

/// Upper bound on a single frame
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Where the IPC server listens
#[derive(Debug, Clone)]
pub enum IpcEndpoint {
    Unix(PathBuf),
    Tcp(u16),
}

/// The bound listener
pub enum IpcListener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

/// One accepted client connection
pub enum IpcStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl IpcListener {
    /// Bind the endpoint, cleaning up a stale socket file first
    pub async fn bind(endpoint: &IpcEndpoint) -> Result<Self> {
        match endpoint {
            IpcEndpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
                }
                if path.exists() {
                    debug!(path = %path.display(), "Removing stale socket");
                    std::fs::remove_file(path).context("Failed to remove stale socket")?;
                }
                let listener = UnixListener::bind(path).context("Failed to bind IPC socket")?;
                Ok(Self::Unix(listener, path.clone()))
            }
            IpcEndpoint::Tcp(port) => {
                let listener = TcpListener::bind(("127.0.0.1", *port))
                    .await
                    .context("Failed to bind loopback IPC port")?;
                Ok(Self::Tcp(listener))
            }
        }
    }

    pub async fn accept(&self) -> Result<IpcStream> {
        match self {
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await.context("accept failed")?;
                Ok(IpcStream::Unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await.context("accept failed")?;
                Ok(IpcStream::Tcp(stream))
            }
        }
    }

    /// Remove the socket file on shutdown
    pub fn cleanup(&self) {
        if let Self::Unix(_, path) = self
            && path.exists()
            && let Err(e) = std::fs::remove_file(path)
        {
            warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).context("Failed to serialize frame")?;
    if payload.len() > MAX_FRAME_SIZE {
        eyre::bail!("frame too large: {} bytes", payload.len());
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .context("Failed to write frame length")?;
    writer.write_all(&payload).await.context("Failed to write frame body")?;
    writer.flush().await.context("Failed to flush frame")?;
    Ok(())
}

/// Read one frame; `None` on a clean end-of-stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame length"),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        eyre::bail!("frame too large: {len} bytes");
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("Failed to read frame body")?;
    let value = serde_json::from_slice(&payload).context("Failed to parse frame")?;
    Ok(Some(value))
}

/// Default endpoint for a state root and daemon config
pub fn endpoint_for(socket_path: Option<&Path>, root: &Path) -> IpcEndpoint {
    IpcEndpoint::Unix(
        socket_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.join("poppod.sock")),
    )
}
