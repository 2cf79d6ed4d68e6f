//! Event bus - central pub/sub for daemon events
//!
//! Built on tokio broadcast channels. Components emit events; consumers
//! (the IPC server, tests) subscribe. Emission is fire-and-forget: with no
//! subscribers the event is dropped, and slow subscribers lose the oldest
//! events rather than blocking emitters.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::DaemonEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Central event bus, cheap to clone
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: DaemonEvent) {
        debug!(event = event.name(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(DaemonEvent::QueueResumed);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "queue-resumed");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::default();
        // No subscriber; must not panic or error
        bus.emit(DaemonEvent::SessionCleared);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(DaemonEvent::SessionInvalid);

        assert_eq!(rx1.recv().await.unwrap().name(), "session-invalid");
        assert_eq!(rx2.recv().await.unwrap().name(), "session-invalid");
    }
}
