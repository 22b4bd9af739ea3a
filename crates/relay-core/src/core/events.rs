//! Chat engine events.
//!
//! Published on the engine's `EventBus` while a reply streams and when the
//! user interrupts. Events are serializable so front ends can forward them
//! as JSON.

use serde::Serialize;
use serde_json::Value;

/// What the interrupt protocol did to the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptOutcome {
    /// The unanswered user message was removed; its text went back to the input.
    RolledBack { text: String },
    /// Outstanding tool requests were answered with an interruption error.
    ToolCallsCancelled { ids: Vec<String> },
    NothingPending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    StreamStarted {
        session_id: String,
    },

    /// Incremental assistant text.
    AssistantDelta {
        text: String,
    },

    ToolRequested {
        id: String,
        name: String,
    },

    /// The agent needs approval before running a tool.
    ToolConfirmationRequested {
        id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },

    /// Tool log or progress, keyed by the originating request id.
    Notification {
        request_id: String,
        message: Value,
    },

    ModelChanged {
        model: String,
        mode: String,
    },

    /// Stream-level error. The conversation is kept.
    Error {
        message: String,
    },

    /// Streaming ended. `reason` is `None` when the connection closed
    /// without a finish marker.
    Finished {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Interrupted {
        outcome: InterruptOutcome,
    },

    /// Text put back into the input draft.
    InputRestored {
        text: String,
    },

    CreateRecipeRequested,
}

impl ChatEvent {
    /// True for events after which no more stream events follow.
    pub fn ends_stream(&self) -> bool {
        matches!(
            self,
            ChatEvent::Error { .. } | ChatEvent::Finished { .. } | ChatEvent::Interrupted { .. }
        )
    }
}
