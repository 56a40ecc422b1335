//! Lifecycle event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// Root filesystem mounted.
    Mounted {
        name: String,
        target: String,
        timestamp: i64,
    },
    /// Root filesystem unmounted.
    Unmounted { name: String, timestamp: i64 },
    /// Container booted its init system.
    Booted { name: String, timestamp: i64 },
    /// Container entered chroot mode.
    ChrootStarted { name: String, timestamp: i64 },
    /// Running session stopped.
    Stopped { name: String, timestamp: i64 },
}

impl LifecycleEvent {
    /// Name of the container the event belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Mounted { name, .. }
            | Self::Unmounted { name, .. }
            | Self::Booted { name, .. }
            | Self::ChrootStarted { name, .. }
            | Self::Stopped { name, .. } => name,
        }
    }
}

/// Event bus for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(LifecycleEvent::Booted {
            name: "buildkit".into(),
            timestamp: 1,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "buildkit");
        assert!(matches!(event, LifecycleEvent::Booted { .. }));
    }

    #[test]
    fn publish_without_subscribers() {
        EventBus::new().publish(LifecycleEvent::Unmounted {
            name: "x".into(),
            timestamp: now(),
        });
    }
}
