//! Host event bus.
//!
//! Lifecycle events are broadcast to every subscriber; slow subscribers drop
//! the oldest events rather than applying backpressure to the coordinator.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::queue::LoadPriority;

/// A lifecycle event emitted by the host.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HostEvent {
    /// A plugin finished loading and its instance is available.
    PluginLoaded {
        name: String,
        priority: LoadPriority,
        load_time_ms: u64,
    },
    /// A plugin's load attempts were exhausted and the task was dropped.
    PluginLoadFailed {
        name: String,
        attempts: u32,
        error: String,
    },
    /// A plugin instance was torn down.
    PluginUnloaded { name: String },
}

/// Broadcast fan-out for [`HostEvent`]s.  Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<HostEvent>>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HostEvent>> {
        self.tx.subscribe()
    }

    /// Publish an event.  Lost sends (no subscribers) are fine.
    pub fn publish(&self, event: HostEvent) {
        tracing::debug!(event = ?event, "host event");
        let _ = self.tx.send(Arc::new(event));
    }
}
