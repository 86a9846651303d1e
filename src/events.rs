// Events published by supervisors to the outside world

use crate::logs::LogEntry;
use crate::process::ProcessStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event emitted on every observable supervisor transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisorEvent {
    /// Process status changed
    #[serde(rename_all = "camelCase")]
    Status {
        analysis_id: String,
        analysis_name: String,
        status: ProcessStatus,
        intended_state: ProcessStatus,
        enabled: bool,
        exit_code: Option<i32>,
    },
    /// A single log line was recorded
    #[serde(rename_all = "camelCase")]
    Log { analysis_id: String, entry: LogEntry },
    /// Log counters after a write
    #[serde(rename_all = "camelCase")]
    LogStats {
        analysis_id: String,
        total_count: u64,
        log_file_size: u64,
    },
    /// The log history was wiped
    #[serde(rename_all = "camelCase")]
    LogsCleared { analysis_id: String },
}

impl SupervisorEvent {
    pub fn analysis_id(&self) -> &str {
        match self {
            SupervisorEvent::Status { analysis_id, .. }
            | SupervisorEvent::Log { analysis_id, .. }
            | SupervisorEvent::LogStats { analysis_id, .. }
            | SupervisorEvent::LogsCleared { analysis_id } => analysis_id,
        }
    }
}

/// Publish/subscribe collaborator receiving supervisor events
pub trait EventSink: Send + Sync {
    /// Publish an event. Must not block and must not fail.
    fn broadcast(&self, event: SupervisorEvent);
}

/// Event sink backed by a tokio broadcast channel
#[derive(Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ChannelBroadcaster {
    fn broadcast(&self, event: SupervisorEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}
