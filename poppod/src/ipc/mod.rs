//! IPC surface: length-prefixed JSON frames over a Unix socket or loopback TCP

mod client;
mod listener;
mod messages;
mod server;

pub use client::DaemonClient;
pub use listener::{
    IpcEndpoint, IpcListener, IpcStream, MAX_FRAME_SIZE, endpoint_for, read_frame, write_frame,
};
pub use messages::{ErrorBody, EventFrame, Reply, Request, ServerFrame};
pub use server::IpcServer;
