//! Streaming chat engine.
//!
//! Owns one [`Session`] handed over by the lifecycle. `append` updates the
//! local transcript synchronously, then streams the reply on a background
//! task. `stop` cancels that task and repairs the transcript so every tool
//! request keeps exactly one response.
//!
//! One engine per session: the engine does not guard against a second
//! engine submitting against the same session id.

mod interrupt;
mod stream;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use interrupt::{INTERRUPTED_NOTICE, repair_transcript};

use super::bus::{EventBus, Subscription};
use super::events::{ChatEvent, InterruptOutcome};
use super::input_history::InputHistory;
use super::recipe_gate::{GatePhase, initial_prompt};
use super::session::{ParameterValues, Session, TokenUsage};
use super::tokens::TokenCounters;
use super::watchdog::{NoopGuard, ResourceGuard};
use crate::config::{Config, HistoryWindow};
use crate::conversation::{Message, Role};
use crate::gateway::{AgentTransport, GatewayResult, ReplyRequest, ToolConfirmationAction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// A reply is still streaming.
    Busy,
    EmptyMessage,
    /// `index` does not name a plain user message.
    NotEditable(usize),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Busy => write!(f, "a reply is still streaming"),
            ChatError::EmptyMessage => write!(f, "message is empty"),
            ChatError::NotEditable(index) => {
                write!(f, "message {index} is not a user message that can be edited")
            }
        }
    }
}

impl std::error::Error for ChatError {}

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub history_window: HistoryWindow,
    /// Ceiling after which a held stream resource is force-released.
    pub stream_watchdog: Duration,
    pub input_history_limit: usize,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            history_window: HistoryWindow::Full,
            stream_watchdog: Duration::from_secs(Config::DEFAULT_STREAM_WATCHDOG_SECS),
            input_history_limit: Config::DEFAULT_INPUT_HISTORY_LIMIT,
        }
    }
}

impl ChatOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            history_window: config.history_window,
            stream_watchdog: config.stream_watchdog(),
            input_history_limit: config.input_history_limit,
        }
    }
}

pub type FinishHook = Arc<dyn Fn(Option<&str>) + Send + Sync>;

pub(crate) struct ChatState {
    session: Session,
    /// Cancellation of the in-flight stream; `None` while idle.
    streaming: Option<CancellationToken>,
    /// Index of the first message produced by the current turn's reply.
    turn_start: usize,
    turn_started_at: Option<Instant>,
    notifications: BTreeMap<String, Vec<Value>>,
    last_error: Option<String>,
    input_draft: String,
    input_history: InputHistory,
    tokens: TokenCounters,
}

pub(crate) type SharedState = Arc<Mutex<ChatState>>;

pub(crate) fn lock(state: &Mutex<ChatState>) -> MutexGuard<'_, ChatState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ChatEngine {
    transport: Arc<dyn AgentTransport>,
    state: SharedState,
    bus: EventBus<ChatEvent>,
    options: ChatOptions,
    guard: Arc<dyn ResourceGuard>,
    on_finish: Option<FinishHook>,
}

impl ChatEngine {
    pub fn new(session: Session, transport: Arc<dyn AgentTransport>, options: ChatOptions) -> Self {
        let state = ChatState {
            turn_start: session.messages.len(),
            session,
            streaming: None,
            turn_started_at: None,
            notifications: BTreeMap::new(),
            last_error: None,
            input_draft: String::new(),
            input_history: InputHistory::new(options.input_history_limit),
            tokens: TokenCounters::default(),
        };
        Self {
            transport,
            state: Arc::new(Mutex::new(state)),
            bus: EventBus::new(),
            options,
            guard: Arc::new(NoopGuard),
            on_finish: None,
        }
    }

    /// Publishes on `bus` instead of a private one.
    #[must_use]
    pub fn with_bus(mut self, bus: EventBus<ChatEvent>) -> Self {
        self.bus = bus;
        self
    }

    /// Resource held while a reply streams.
    #[must_use]
    pub fn with_guard(mut self, guard: Arc<dyn ResourceGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Called with the finish reason whenever a stream ends normally.
    #[must_use]
    pub fn on_finish(mut self, hook: impl Fn(Option<&str>) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(hook));
        self
    }

    pub fn subscribe(&self) -> Subscription<ChatEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus<ChatEvent> {
        &self.bus
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        lock(&self.state)
    }

    /// Sends `text` as a new user turn.
    pub fn submit(&self, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.append(Message::user().with_text(text))
    }

    /// Appends `message` to the transcript and starts streaming the reply.
    ///
    /// The transcript is updated before this returns, whether or not the
    /// reply request later succeeds.
    pub fn append(&self, message: Message) -> Result<(), ChatError> {
        let (request, cancel) = {
            let mut state = self.lock();
            if state.streaming.is_some() {
                return Err(ChatError::Busy);
            }
            if message.is_plain_user_message() {
                let text = message.text();
                state.input_history.push(&text);
            }
            state.tokens.record(&message);
            state.session.messages.push(message);
            state.turn_start = state.session.messages.len();
            state.turn_started_at = Some(Instant::now());
            state.notifications.clear();
            state.last_error = None;

            let cancel = CancellationToken::new();
            state.streaming = Some(cancel.clone());
            (self.reply_request(&state.session), cancel)
        };

        tracing::debug!(
            session_id = %request.session_id,
            messages = request.messages.len(),
            "Submitting turn"
        );
        self.bus.publish(ChatEvent::StreamStarted {
            session_id: request.session_id.clone(),
        });

        tokio::spawn(stream::run(stream::StreamTask {
            state: Arc::clone(&self.state),
            transport: Arc::clone(&self.transport),
            bus: self.bus.clone(),
            request,
            cancel,
            guard: Arc::clone(&self.guard),
            ceiling: self.options.stream_watchdog,
            on_finish: self.on_finish.clone(),
        }));
        Ok(())
    }

    fn reply_request(&self, session: &Session) -> ReplyRequest {
        let start = match self.options.history_window {
            HistoryWindow::Full => 0,
            HistoryWindow::Promoted => session.context_start.min(session.messages.len()),
        };
        ReplyRequest {
            messages: session.messages[start..]
                .iter()
                .filter(|m| m.metadata.agent_visible)
                .cloned()
                .collect(),
            session_id: session.id.clone(),
            working_dir: session.working_dir.clone(),
            recipe_name: session.recipe.as_ref().map(|r| r.title.clone()),
            recipe_version: session.recipe.as_ref().map(|r| r.version.clone()),
        }
    }

    /// Cancels the in-flight reply and repairs the transcript.
    ///
    /// Returns `None` when nothing was streaming.
    pub fn stop(&self) -> Option<InterruptOutcome> {
        let (outcome, restored) = {
            let mut state = self.lock();
            let cancel = state.streaming.take()?;
            cancel.cancel();

            // The stream task skips its accounting once cancelled.
            let turn_start = state.turn_start.min(state.session.messages.len());
            let produced: Vec<Message> = state.session.messages[turn_start..]
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .cloned()
                .collect();
            for message in &produced {
                state.tokens.record(message);
            }
            let pending_user = state
                .session
                .messages
                .last()
                .filter(|m| m.is_plain_user_message())
                .cloned();

            let outcome = repair_transcript(&mut state.session.messages);
            let restored = match &outcome {
                InterruptOutcome::RolledBack { text } => {
                    if let Some(message) = &pending_user {
                        state.tokens.forget(message);
                    }
                    state.input_history.push(text);
                    state.input_draft.clone_from(text);
                    Some(text.clone())
                }
                _ => None,
            };
            state.turn_start = state.session.messages.len();
            (outcome, restored)
        };

        tracing::info!(?outcome, "Reply interrupted");
        self.bus.publish(ChatEvent::Interrupted {
            outcome: outcome.clone(),
        });
        if let Some(text) = restored {
            self.bus.publish(ChatEvent::InputRestored { text });
        }
        Some(outcome)
    }

    /// Rewinds to just before user message `index` and replays it as `text`.
    pub fn edit(&self, index: usize, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        {
            let state = self.lock();
            let editable = state
                .session
                .messages
                .get(index)
                .is_some_and(Message::is_plain_user_message);
            if !editable {
                return Err(ChatError::NotEditable(index));
            }
        }
        self.stop();

        {
            let mut state = self.lock();
            // stop() may have rolled the edited message back already.
            let messages = &mut state.session.messages;
            messages.truncate(index.min(messages.len()));
            let len = messages.len();
            state.session.context_start = state.session.context_start.min(len);
            state.input_draft.clear();
        }
        self.submit(text)
    }

    /// Resolved parameter values used for recipe prompt substitution.
    pub fn set_parameters(&self, values: ParameterValues) {
        self.lock().session.parameters = Some(values);
    }

    /// Sends the recipe prompt as the first message once the gate is ready.
    ///
    /// Returns `Ok(false)` when there is nothing to run.
    pub fn run_recipe_prompt(&self, phase: &GatePhase) -> Result<bool, ChatError> {
        if *phase != GatePhase::Ready {
            return Ok(false);
        }
        let prompt = {
            let state = self.lock();
            if !state.session.messages.is_empty() {
                return Ok(false);
            }
            let Some(recipe) = &state.session.recipe else {
                return Ok(false);
            };
            let given = state.session.parameters.clone().unwrap_or_default();
            initial_prompt(recipe, &given)
        };
        match prompt {
            Some(prompt) if !prompt.trim().is_empty() => {
                self.append(Message::user().with_text(prompt))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pulls authoritative token counts from the server while idle.
    ///
    /// Returns `Ok(false)` without a request while a reply is streaming.
    pub async fn refresh_token_usage(&self) -> GatewayResult<bool> {
        let session_id = {
            let state = self.lock();
            if state.streaming.is_some() {
                return Ok(false);
            }
            state.session.id.clone()
        };
        let snapshot = self.transport.session(&session_id).await?;
        let mut state = self.lock();
        if state.streaming.is_some() {
            return Ok(false);
        }
        state.session.usage = TokenUsage::from(&snapshot.metadata);
        Ok(true)
    }

    pub async fn confirm_tool(
        &self,
        request_id: &str,
        action: ToolConfirmationAction,
    ) -> GatewayResult<()> {
        let session_id = self.session_id();
        self.transport
            .confirm_tool(&session_id, request_id, action)
            .await
    }

    /// Marks everything so far as promoted history.
    pub fn promote_history(&self) {
        let mut state = self.lock();
        state.session.context_start = state.session.messages.len();
    }

    /// Asks front ends to draft a recipe from this conversation.
    pub fn request_recipe_from_chat(&self) {
        self.bus.publish(ChatEvent::CreateRecipeRequested);
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming.is_some()
    }

    pub fn session_id(&self) -> String {
        self.lock().session.id.clone()
    }

    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().session.messages.clone()
    }

    pub fn notifications(&self) -> BTreeMap<String, Vec<Value>> {
        self.lock().notifications.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn input_draft(&self) -> String {
        self.lock().input_draft.clone()
    }

    pub fn take_input_draft(&self) -> String {
        std::mem::take(&mut self.lock().input_draft)
    }

    pub fn search_input_history(&self, query: &str) -> Vec<String> {
        self.lock()
            .input_history
            .search(query)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Local estimates, not billing counts.
    pub fn token_estimates(&self) -> TokenCounters {
        self.lock().tokens
    }

    /// Last authoritative counts fetched from the server.
    pub fn usage(&self) -> TokenUsage {
        self.lock().session.usage
    }
}
