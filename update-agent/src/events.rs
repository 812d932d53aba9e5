//! Status events for whatever observer is attached (CLI, GUI, logger).
//!
//! The worker never holds a reference into presentation state: it pushes
//! events into a broadcast channel and observers receive them at their own
//! pace. A slow observer skips ahead instead of blocking the worker.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Maximum number of queued events per subscriber
const STATUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum StatusEvent {
    /// Progress update
    #[serde(rename = "status:progress")]
    Progress { percent: u8, message: String },

    /// Terminal success
    #[serde(rename = "status:completed")]
    Completed { files_updated: usize },

    /// Terminal failure
    #[serde(rename = "status:failed")]
    Failed { error: String },
}

impl StatusEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusEvent::Progress { .. })
    }
}

/// Fire-and-forget sending half of the status channel.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusSender {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: StatusEvent) {
        // No receivers is not an error
        let _ = self.tx.send(event);
    }

    /// Send a progress event and mirror it to the log.
    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.send(StatusEvent::Progress {
            percent: percent.min(100),
            message,
        });
    }
}

impl Default for StatusSender {
    fn default() -> Self {
        Self::new()
    }
}
