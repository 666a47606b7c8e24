//! Status Events
//!
//! Fire-and-forget notifications for UI listeners. Late subscribers see
//! nothing that was published before they attached; they read the current
//! state from the store first and then follow the feed.

use crate::lifecycle::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Feed capacity; slow subscribers lose the oldest events
const EVENT_CAPACITY: usize = 128;

/// Event published by the lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatusEvent {
    /// `{"type": "status-update", "state": "connected"}`
    StatusUpdate { state: ConnectionState },
    /// `{"type": "toast", "message": "..."}`
    Toast { message: String },
}

/// Broadcast bus for [`StatusEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        debug!("Event: {:?}", event);
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn status(&self, state: ConnectionState) {
        self.publish(StatusEvent::StatusUpdate { state });
    }

    pub fn toast(&self, message: impl Into<String>) {
        self.publish(StatusEvent::Toast {
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Toast sender honouring the notifications setting
///
/// Status updates always go out; toasts only while notifications are
/// enabled, except those sent through [`Notifier::announce`].
#[derive(Debug, Clone)]
pub struct Notifier {
    bus: EventBus,
    enabled: Arc<AtomicBool>,
}

impl Notifier {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn status(&self, state: ConnectionState) {
        self.bus.status(state);
    }

    /// Toast, unless notifications are disabled
    pub fn toast(&self, message: impl Into<String>) {
        let message = message.into();
        if self.is_enabled() {
            self.bus.toast(message);
        } else {
            debug!("Toast suppressed: {}", message);
        }
    }

    /// Toast regardless of the setting
    pub fn announce(&self, message: impl Into<String>) {
        self.bus.toast(message);
    }
}
