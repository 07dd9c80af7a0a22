//! Rolling conversation history for the agent loop's tool-reaction rounds.
//!
//! Generalizes a token-budget trim into a count-bounded "extra history":
//! the model's assistant message (with tool call) and the textual tool
//! result are appended to a rolling history, bounded at ~16 entries.

use crate::llm::{Role, Turn};

/// `(role, content, tool-call-id?, tool-name?)` — a single conversation
/// message entity.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

impl ConversationMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        ConversationMessage {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        ConversationMessage {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: None,
            tool_name: Some(tool_name.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ConversationMessage {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
        }
    }
}

/// Default cap on the number of entries retained in the per-message extra
/// history.
pub const MAX_EXTRA_HISTORY: usize = 16;

/// Bounded rolling history for a single user message's tool-reaction
/// rounds. One `ExtraHistory` is created per `AssemblePrompt` entry and
/// discarded at `Finalize` — it is not the same thing as a chat bridge's
/// full persisted transcript, which lives in the durable store.
pub struct ExtraHistory {
    entries: Vec<ConversationMessage>,
    max_entries: usize,
}

impl ExtraHistory {
    pub fn new() -> Self {
        ExtraHistory {
            entries: Vec::new(),
            max_entries: MAX_EXTRA_HISTORY,
        }
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.entries.push(message);
        while self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the history as wire turns for the next provider call.
    pub fn as_turns(&self) -> Vec<Turn> {
        self.entries
            .iter()
            .map(|m| Turn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }
}

impl Default for ExtraHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_beyond_cap_drops_oldest() {
        let mut history = ExtraHistory::new();
        for i in 0..(MAX_EXTRA_HISTORY + 5) {
            history.push(ConversationMessage::user(format!("msg-{i}")));
        }
        assert_eq!(history.len(), MAX_EXTRA_HISTORY);
        assert_eq!(history.as_turns()[0].content, "msg-5");
    }

    #[test]
    fn as_turns_preserves_order() {
        let mut history = ExtraHistory::new();
        history.push(ConversationMessage::assistant("a"));
        history.push(ConversationMessage::tool_result("echo", "b"));
        let turns = history.as_turns();
        assert_eq!(turns[0].content, "a");
        assert_eq!(turns[1].content, "b");
    }
}
