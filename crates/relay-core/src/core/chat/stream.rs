//! Background task consuming one reply stream.
//!
//! Every state mutation happens under the engine lock after checking the
//! cancellation token, so nothing lands in the transcript once `stop` has
//! run the interrupt protocol.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{FinishHook, SharedState, lock};
use crate::conversation::{Message, MessageContent, Role};
use crate::core::bus::EventBus;
use crate::core::events::ChatEvent;
use crate::core::watchdog::{self, ResourceGuard};
use crate::gateway::{AgentTransport, ReplyEvent, ReplyRequest};

pub(super) struct StreamTask {
    pub state: SharedState,
    pub transport: Arc<dyn AgentTransport>,
    pub bus: EventBus<ChatEvent>,
    pub request: ReplyRequest,
    pub cancel: CancellationToken,
    pub guard: Arc<dyn ResourceGuard>,
    pub ceiling: Duration,
    pub on_finish: Option<FinishHook>,
}

enum Flow {
    Continue,
    Done,
}

pub(super) async fn run(task: StreamTask) {
    let _held = watchdog::hold(Arc::clone(&task.guard), task.ceiling);
    let cancel = task.cancel.clone();

    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        opened = task.transport.reply(task.request.clone(), cancel.clone()) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(err) => {
            task.fail(err.to_string());
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if let Flow::Done = task.apply(event) {
                    return;
                }
            }
            Some(Err(err)) => {
                task.fail(err.to_string());
                return;
            }
            None => {
                task.finish(None);
                return;
            }
        }
    }
}

impl StreamTask {
    fn apply(&self, event: ReplyEvent) -> Flow {
        match event {
            ReplyEvent::Message { message } => {
                let events = {
                    let mut state = lock(&self.state);
                    if self.cancel.is_cancelled() {
                        return Flow::Done;
                    }
                    let events = describe(&message);
                    merge_into_tail(&mut state.session.messages, message);
                    events
                };
                for event in events {
                    self.bus.publish(event);
                }
                Flow::Continue
            }
            ReplyEvent::Notification {
                request_id,
                message,
            } => {
                {
                    let mut state = lock(&self.state);
                    if self.cancel.is_cancelled() {
                        return Flow::Done;
                    }
                    state
                        .notifications
                        .entry(request_id.clone())
                        .or_default()
                        .push(message.clone());
                }
                self.bus.publish(ChatEvent::Notification {
                    request_id,
                    message,
                });
                Flow::Continue
            }
            ReplyEvent::ModelChange { model, mode } => {
                if self.cancel.is_cancelled() {
                    return Flow::Done;
                }
                tracing::info!(%model, %mode, "Model changed");
                self.bus.publish(ChatEvent::ModelChanged { model, mode });
                Flow::Continue
            }
            ReplyEvent::Error { error } => {
                self.fail(error);
                Flow::Done
            }
            ReplyEvent::Finish { reason } => {
                self.finish(Some(reason));
                Flow::Done
            }
            ReplyEvent::Ping => Flow::Continue,
            ReplyEvent::Unknown => {
                tracing::debug!("Ignoring unknown reply event");
                Flow::Continue
            }
        }
    }

    /// Ends the stream, keeping the transcript. Returns false if stopped.
    fn end(&self, error: Option<&str>) -> bool {
        let mut state = lock(&self.state);
        if self.cancel.is_cancelled() {
            return false;
        }
        state.streaming = None;
        if let Some(message) = error {
            state.last_error = Some(message.to_string());
        }
        let turn_start = state.turn_start.min(state.session.messages.len());
        let produced: Vec<Message> = state.session.messages[turn_start..]
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .cloned()
            .collect();
        for message in &produced {
            state.tokens.record(message);
        }
        if let Some(started) = state.turn_started_at.take() {
            tracing::debug!(
                elapsed_ms = started.elapsed().as_millis(),
                "Reply stream ended"
            );
        }
        true
    }

    fn fail(&self, message: String) {
        if !self.end(Some(&message)) {
            return;
        }
        tracing::warn!(error = %message, "Reply stream failed");
        self.bus.publish(ChatEvent::Error { message });
    }

    fn finish(&self, reason: Option<String>) {
        if !self.end(None) {
            return;
        }
        if let Some(hook) = &self.on_finish {
            hook(reason.as_deref());
        }
        self.bus.publish(ChatEvent::Finished { reason });
    }
}

/// Events announcing the content of an incoming message.
fn describe(message: &Message) -> Vec<ChatEvent> {
    if message.role != Role::Assistant {
        return Vec::new();
    }
    message
        .content
        .iter()
        .filter_map(|block| match block {
            MessageContent::Text(text) if !text.text.is_empty() => {
                Some(ChatEvent::AssistantDelta {
                    text: text.text.clone(),
                })
            }
            MessageContent::ToolRequest(request) => Some(ChatEvent::ToolRequested {
                id: request.id.clone(),
                name: request.tool_name().unwrap_or_default().to_string(),
            }),
            MessageContent::ToolConfirmationRequest(request) => {
                Some(ChatEvent::ToolConfirmationRequested {
                    id: request.id.clone(),
                    tool_name: request.tool_name.clone(),
                    prompt: request.prompt.clone(),
                })
            }
            _ => None,
        })
        .collect()
}

/// Adds `incoming` to the transcript.
///
/// A chunk carrying the tail message's id extends that message: text runs
/// are concatenated, other blocks appended. Anything else is a new message.
pub(super) fn merge_into_tail(messages: &mut Vec<Message>, incoming: Message) {
    let continues_tail = messages
        .last()
        .is_some_and(|last| last.id.is_some() && last.id == incoming.id);
    if !continues_tail {
        messages.push(incoming);
        return;
    }
    let Some(tail) = messages.last_mut() else {
        return;
    };
    for block in incoming.content {
        match (tail.content.last_mut(), block) {
            (Some(MessageContent::Text(existing)), MessageContent::Text(chunk)) => {
                existing.text.push_str(&chunk.text);
            }
            (_, block) => tail.content.push(block),
        }
    }
}
