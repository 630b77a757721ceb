//! Notifications a chat session publishes to its front end.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::agent_api::{ChatMessage, MessageMetrics, TurnState};

/// Session state changes, delivered in the order they happen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The active turn moved to a new state
    TurnStateChanged(TurnState),
    /// A message was added to the history
    MessageAppended(ChatMessage),
    /// Text appended to a streaming assistant message
    ContentDelta { message_id: Uuid, delta: String },
    /// Timings computed when an assistant message finished streaming
    MetricsUpdated {
        message_id: Uuid,
        metrics: MessageMetrics,
    },
    /// An action parsed from the assistant reply is about to run
    ActionStarted { summary: String },
    /// EDIT_FILE wrote this path; the file tree should select it after refresh
    FileEdited { path: PathBuf },
    /// The automatic action loop stopped at the configured bound
    ToolLoopLimit { iterations: usize },
    /// Connection or generation failure; the turn was aborted
    Error(String),
    HistoryCleared,
}

impl SessionEvent {
    /// Whether the event should be hidden from a transcript view.
    pub fn is_synthetic_message(&self) -> bool {
        matches!(self, SessionEvent::MessageAppended(msg) if msg.synthetic)
    }
}
