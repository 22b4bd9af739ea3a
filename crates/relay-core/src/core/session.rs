//! The live session handed from the lifecycle to the chat engine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::conversation::Message;
use crate::gateway::{SessionMetadata, SessionSnapshot};
use crate::recipe::Recipe;

/// Resolved recipe parameter values keyed by parameter key.
pub type ParameterValues = BTreeMap<String, String>;

/// Server-side token counts for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub total: Option<i64>,
    pub input: Option<i64>,
    pub output: Option<i64>,
}

impl From<&SessionMetadata> for TokenUsage {
    fn from(metadata: &SessionMetadata) -> Self {
        Self {
            total: metadata.total_tokens,
            input: metadata.input_tokens,
            output: metadata.output_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub working_dir: PathBuf,
    pub messages: Vec<Message>,
    /// Index of the first message in the active context window.
    pub context_start: usize,
    pub recipe: Option<Recipe>,
    /// Whether `recipe` came from the server's session record rather than
    /// from the caller.
    pub recipe_from_server: bool,
    pub parameters: Option<ParameterValues>,
    pub usage: TokenUsage,
}

impl Session {
    pub const DEFAULT_TITLE: &str = "New Chat";

    /// Builds a session from a server echo.
    ///
    /// The echoed recipe wins; `local_recipe` fills in only when the server
    /// returned none.
    pub fn from_snapshot(
        snapshot: SessionSnapshot,
        local_recipe: Option<Recipe>,
        fallback_dir: PathBuf,
    ) -> Self {
        let usage = TokenUsage::from(&snapshot.metadata);
        let SessionMetadata {
            working_dir,
            description,
            recipe,
            user_recipe_values,
            ..
        } = snapshot.metadata;

        let recipe_from_server = recipe.is_some();
        Self {
            id: snapshot.session_id,
            title: description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| Self::DEFAULT_TITLE.to_string()),
            working_dir: working_dir.unwrap_or(fallback_dir),
            messages: snapshot.messages,
            context_start: 0,
            recipe: recipe.or(local_recipe),
            recipe_from_server,
            parameters: user_recipe_values,
            usage,
        }
    }

    /// Binds a different recipe, dropping the conversation built on the old one.
    pub fn replace_recipe(&mut self, recipe: Recipe) {
        self.recipe = Some(recipe);
        self.recipe_from_server = false;
        self.messages.clear();
        self.parameters = None;
        self.context_start = 0;
    }
}
