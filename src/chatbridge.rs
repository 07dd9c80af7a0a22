//! Chat bridge contract.
//!
//! The long-poll loop against a chat platform's API is out of scope here —
//! this is the contract a concrete bridge implements, nothing more.

use async_trait::async_trait;

use crate::error::CoreError;

/// `receive(chat_id, text)` is how a concrete bridge hands the core an
/// inbound message; `send(chat_id, text)` is how the core replies. A
/// single "allowed peer id" is enforced by the caller, not by this trait —
/// messages from other peers are discarded with a warn-level audit before
/// ever reaching an `AgentLoop`.
#[async_trait]
pub trait ChatBridge: Send + Sync {
    async fn receive(&mut self) -> Result<Option<(String, String)>, CoreError>;
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), CoreError>;
}
