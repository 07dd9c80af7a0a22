//! The agent loop: prompt assembly, provider fallback chain, tool-call
//! extraction, bounded reaction rounds, output safety.

pub mod loop_;
pub mod session;

pub use loop_::{AgentLoop, OUTPUT_REFUSAL_TEXT};
pub use session::{ConversationMessage, ExtraHistory};
