//! Transcript repair after the user stops a reply.
//!
//! Every tool request in the transcript must end up with exactly one
//! response, and a user message that never got an answer is withdrawn.

use std::collections::HashSet;

use crate::conversation::{Message, MessageContent, Role};
use crate::core::events::InterruptOutcome;

/// Error text of the synthetic response sent for each cancelled tool call.
pub const INTERRUPTED_NOTICE: &str = "Interrupted by the user to make a correction";

/// Rewrites the tail of `messages` after a stop.
pub fn repair_transcript(messages: &mut Vec<Message>) -> InterruptOutcome {
    let Some(last) = messages.last() else {
        return InterruptOutcome::NothingPending;
    };

    if last.is_plain_user_message() {
        let text = last.text();
        messages.pop();
        return InterruptOutcome::RolledBack { text };
    }

    if last.role != Role::Assistant {
        return InterruptOutcome::NothingPending;
    }

    let answered: HashSet<&str> = messages
        .iter()
        .flat_map(Message::responded_tool_ids)
        .collect();
    let ids: Vec<String> = last
        .requested_tool_ids()
        .into_iter()
        .filter(|id| !answered.contains(id.as_str()))
        .collect();
    if ids.is_empty() {
        return InterruptOutcome::NothingPending;
    }

    let mut responses = Message::user();
    responses.content = ids
        .iter()
        .map(|id| MessageContent::tool_error(id.as_str(), INTERRUPTED_NOTICE))
        .collect();
    messages.push(responses);

    InterruptOutcome::ToolCallsCancelled { ids }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::conversation::{ToolConfirmationRequest, ToolOutcome};

    fn tool_call(id: &str) -> MessageContent {
        MessageContent::tool_request(id, "developer__shell", json!({"command": "ls"}))
    }

    #[test]
    fn test_plain_user_message_is_rolled_back() {
        let mut messages = vec![
            Message::user().with_text("first"),
            Message::assistant().with_text("ok"),
            Message::user().with_text("second"),
        ];

        let outcome = repair_transcript(&mut messages);

        assert_eq!(
            outcome,
            InterruptOutcome::RolledBack {
                text: "second".to_string()
            }
        );
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_every_unanswered_call_gets_one_error_response() {
        let mut messages = vec![
            Message::user().with_text("run things"),
            Message::assistant()
                .with_text("sure")
                .with_content(tool_call("a"))
                .with_content(tool_call("b"))
                .with_content(MessageContent::ToolConfirmationRequest(
                    ToolConfirmationRequest {
                        id: "c".to_string(),
                        tool_name: "developer__shell".to_string(),
                        arguments: json!({}),
                        prompt: None,
                    },
                ))
                .with_content(tool_call("a")),
        ];

        let outcome = repair_transcript(&mut messages);

        assert_eq!(
            outcome,
            InterruptOutcome::ToolCallsCancelled {
                ids: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            }
        );
        assert_eq!(messages.len(), 3);
        let repair = &messages[2];
        assert_eq!(repair.role, Role::User);
        assert_eq!(repair.content.len(), 3);
        for block in &repair.content {
            let MessageContent::ToolResponse(response) = block else {
                panic!("expected tool response, got {block:?}");
            };
            assert_eq!(
                response.tool_result,
                ToolOutcome::Error {
                    error: INTERRUPTED_NOTICE.to_string()
                }
            );
        }
    }

    #[test]
    fn test_already_answered_calls_are_skipped() {
        let mut assistant = Message::assistant()
            .with_content(tool_call("done"))
            .with_content(tool_call("open"));
        assistant.content.push(MessageContent::tool_error("done", "failed"));
        let mut messages = vec![assistant];

        let outcome = repair_transcript(&mut messages);

        assert_eq!(
            outcome,
            InterruptOutcome::ToolCallsCancelled {
                ids: vec!["open".to_string()]
            }
        );
    }

    #[test]
    fn test_resolved_turns_need_nothing() {
        let mut empty = Vec::new();
        assert_eq!(repair_transcript(&mut empty), InterruptOutcome::NothingPending);

        let mut messages = vec![
            Message::user().with_text("hi"),
            Message::assistant().with_text("hello"),
        ];
        assert_eq!(
            repair_transcript(&mut messages),
            InterruptOutcome::NothingPending
        );
        assert_eq!(messages.len(), 2);

        let mut tool_results = vec![
            Message::assistant().with_content(tool_call("x")),
            Message::user().with_content(MessageContent::tool_error("x", "boom")),
        ];
        assert_eq!(
            repair_transcript(&mut tool_results),
            InterruptOutcome::NothingPending
        );
        assert_eq!(tool_results.len(), 2);
    }
}
