use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One event on the build event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildEvent {
    /// Human-readable lifecycle message (e.g. "Pulling base image manifest...").
    Lifecycle { message: String },
    /// A build step finished; `completed`/`total` count whole steps.
    StepProgress {
        description: String,
        completed: u64,
        total: u64,
    },
    /// Byte-level transfer progress for a single blob.
    BlobProgress {
        description: String,
        bytes: u64,
        total_bytes: Option<u64>,
    },
    /// Wall-clock timing for a finished step.
    Timing {
        description: String,
        elapsed_ms: u64,
    },
}

impl BuildEvent {
    /// Create a lifecycle event.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }
}

/// Broadcast-backed dispatcher for [`BuildEvent`]s.
///
/// The pipeline only emits; subscribers (CLI progress bars, log sinks)
/// are wired up by the embedding application.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<BuildEvent>>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: BuildEvent) {
        let _ = self.sender.send(event);
    }

    /// Emit a lifecycle message and mirror it to the tracing stream.
    pub fn lifecycle(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.emit(BuildEvent::Lifecycle { message });
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
