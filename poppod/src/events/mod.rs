//! Typed event bus for daemon-wide notifications

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::DaemonEvent;
