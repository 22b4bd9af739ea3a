//! Conversation data model shared by the transport, the lifecycle and the chat engine.
//!
//! The encoding follows the agent server's wire format: messages carry a
//! `role`, a unix `created` timestamp, a list of `type`-tagged content blocks
//! and visibility metadata. Content blocks the client does not understand are
//! kept verbatim so that history round-trips to the server unchanged.

use std::collections::HashSet;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

fn default_true() -> bool {
    true
}

/// Visibility flags attached to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Whether the message is shown in the chat surface.
    #[serde(default = "default_true")]
    pub user_visible: bool,
    /// Whether the message is part of the agent's context window.
    #[serde(default = "default_true")]
    pub agent_visible: bool,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            user_visible: true,
            agent_visible: true,
        }
    }
}

/// Result envelope used by tool requests and tool responses.
///
/// Serializes as `{"status":"success","value":...}` or
/// `{"status":"error","error":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome<T> {
    Success { value: T },
    Error { error: String },
}

impl<T> ToolOutcome<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error { .. })
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub id: String,
    pub tool_call: ToolOutcome<ToolCall>,
}

impl ToolRequest {
    /// Tool name, or `None` when the model produced an unparseable call.
    pub fn tool_name(&self) -> Option<&str> {
        match &self.tool_call {
            ToolOutcome::Success { value } => Some(value.name.as_str()),
            ToolOutcome::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub id: String,
    pub tool_result: ToolOutcome<Vec<Value>>,
}

/// A tool call that is waiting for a human decision before it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfirmationRequest {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(TextContent),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
    ToolConfirmationRequest(ToolConfirmationRequest),
    /// A block type this client does not interpret (thinking, images, ...).
    Other(Value),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum TaggedRef<'a> {
    Text(&'a TextContent),
    ToolRequest(&'a ToolRequest),
    ToolResponse(&'a ToolResponse),
    ToolConfirmationRequest(&'a ToolConfirmationRequest),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Tagged {
    Text(TextContent),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
    ToolConfirmationRequest(ToolConfirmationRequest),
}

const KNOWN_CONTENT_TYPES: &[&str] = &[
    "text",
    "toolRequest",
    "toolResponse",
    "toolConfirmationRequest",
];

impl Serialize for MessageContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            MessageContent::Text(c) => TaggedRef::Text(c).serialize(serializer),
            MessageContent::ToolRequest(c) => TaggedRef::ToolRequest(c).serialize(serializer),
            MessageContent::ToolResponse(c) => TaggedRef::ToolResponse(c).serialize(serializer),
            MessageContent::ToolConfirmationRequest(c) => {
                TaggedRef::ToolConfirmationRequest(c).serialize(serializer)
            }
            MessageContent::Other(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let known = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| KNOWN_CONTENT_TYPES.contains(&t));
        if !known {
            return Ok(MessageContent::Other(value));
        }

        let tagged = Tagged::deserialize(value).map_err(de::Error::custom)?;
        Ok(match tagged {
            Tagged::Text(c) => MessageContent::Text(c),
            Tagged::ToolRequest(c) => MessageContent::ToolRequest(c),
            Tagged::ToolResponse(c) => MessageContent::ToolResponse(c),
            Tagged::ToolConfirmationRequest(c) => MessageContent::ToolConfirmationRequest(c),
        })
    }
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn tool_request(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        MessageContent::ToolRequest(ToolRequest {
            id: id.into(),
            tool_call: ToolOutcome::Success {
                value: ToolCall {
                    name: name.into(),
                    arguments,
                },
            },
        })
    }

    pub fn tool_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        MessageContent::ToolResponse(ToolResponse {
            id: id.into(),
            tool_result: ToolOutcome::Error {
                error: error.into(),
            },
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        }
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub content: Vec<MessageContent>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    fn new(role: Role) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            role,
            created: chrono::Utc::now().timestamp(),
            content: Vec::new(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user() -> Self {
        Self::new(Role::User)
    }

    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(MessageContent::text(text));
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(MessageContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_tool_response(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, MessageContent::ToolResponse(_)))
    }

    /// A user message typed by a person, as opposed to one carrying tool results.
    pub fn is_plain_user_message(&self) -> bool {
        self.role == Role::User && !self.has_tool_response()
    }

    /// Ids of tool requests and confirmation requests, first occurrence order.
    pub fn requested_tool_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.content
            .iter()
            .filter_map(|c| match c {
                MessageContent::ToolRequest(r) => Some(r.id.as_str()),
                MessageContent::ToolConfirmationRequest(r) => Some(r.id.as_str()),
                _ => None,
            })
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect()
    }

    pub fn responded_tool_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|c| match c {
            MessageContent::ToolResponse(r) => Some(r.id.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_tool_request_wire_shape() {
        let message = Message::assistant().with_content(MessageContent::tool_request(
            "call_1",
            "developer__shell",
            json!({"command": "ls"}),
        ));
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"][0]["type"], "toolRequest");
        assert_eq!(value["content"][0]["toolCall"]["status"], "success");
        assert_eq!(
            value["content"][0]["toolCall"]["value"]["name"],
            "developer__shell"
        );
        assert_eq!(value["metadata"]["userVisible"], true);
    }

    #[test]
    fn test_unknown_content_is_preserved() {
        let raw = json!({
            "role": "assistant",
            "created": 1,
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                {"type": "text", "text": "done"}
            ]
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();

        assert!(matches!(message.content[0], MessageContent::Other(_)));
        assert_eq!(message.text(), "done");
        assert_eq!(serde_json::to_value(&message).unwrap()["content"], raw["content"]);
    }

    #[test]
    fn test_requested_tool_ids_dedupes_confirmation_of_same_call() {
        let message = Message::assistant()
            .with_content(MessageContent::tool_request("a", "shell", json!({})))
            .with_content(MessageContent::ToolConfirmationRequest(
                ToolConfirmationRequest {
                    id: "a".to_string(),
                    tool_name: "shell".to_string(),
                    arguments: json!({}),
                    prompt: None,
                },
            ))
            .with_content(MessageContent::tool_request("b", "read", json!({})));

        assert_eq!(message.requested_tool_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_missing_metadata_defaults_to_visible() {
        let message: Message =
            serde_json::from_value(json!({"role": "user", "content": []})).unwrap();
        assert!(message.metadata.user_visible);
        assert!(message.metadata.agent_visible);
        assert_eq!(message.created, 0);
    }
}
