//! Local token estimates for display.
//!
//! These are approximations (characters / 4, rounded up), never billing
//! counts. Authoritative numbers come from the server's session record.

use crate::conversation::{Message, Role};

pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimate over every text block of a message.
pub fn estimate_message(message: &Message) -> u64 {
    message
        .content
        .iter()
        .filter_map(|c| c.as_text())
        .map(estimate_tokens)
        .sum()
}

/// Running input/output estimates for the current engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounters {
    pub input: u64,
    pub output: u64,
}

impl TokenCounters {
    pub fn record(&mut self, message: &Message) {
        let estimate = estimate_message(message);
        match message.role {
            Role::User => self.input += estimate,
            Role::Assistant => self.output += estimate,
        }
    }

    /// Takes back an estimate added by `record`.
    pub fn forget(&mut self, message: &Message) {
        let estimate = estimate_message(message);
        match message.role {
            Role::User => self.input = self.input.saturating_sub(estimate),
            Role::Assistant => self.output = self.output.saturating_sub(estimate),
        }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}
