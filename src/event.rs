//! Audit / observability layer.
//!
//! A single callback trait with one method per audited occurrence, all
//! defaulting to a no-op, plus a fire-and-forget `emit_sync` for call
//! sites that aren't `async`. Every component that emits an audit event —
//! the tool dispatcher, the mesh coordinator, the proxy — goes through
//! this instead of writing directly to the durable store, so tests can
//! observe audit output without a real store.

use std::sync::Arc;

use async_trait::async_trait;

/// One audited occurrence. Field names mirror the `(kind, subject, detail)`
/// shape of the durable-store contract's `log_event`.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// Tool registry dispatch: `{tool, args, status}`.
    ToolExec {
        tool: String,
        args: String,
        status: ToolStatus,
    },
    /// Chat bridge received a message from a peer other than the configured
    /// allowed peer.
    ChatBridgeUnauthorizedPeer { peer: String },
    /// Mesh dispatch: always emitted, success or failure.
    MeshDispatch {
        task_id: String,
        tool: String,
        node: String,
        success: bool,
    },
    /// Proxy bearer-token mismatch.
    ProxyAuthFailure { caller_hint: String },
    /// Proxy daily budget exceeded.
    ProxyBudgetExceeded { caller: String, budget: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Failure,
}

/// Observability sink. All methods default to a no-op so implementors only
/// override what they care about.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: AuditEvent) {}
}

/// An `EventHandler` that does nothing; the default when no sink is wired
/// up (unit tests, one-off scripts).
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {
    async fn on_event(&self, _event: AuditEvent) {}
}

/// Fire-and-forget emission for non-`async` call sites: spawns a detached
/// task.
pub fn emit_sync(handler: &Arc<dyn EventHandler>, event: AuditEvent) {
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        handler.on_event(event).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_event(&self, event: AuditEvent) {
            self.0.lock().unwrap().push(format!("{event:?}"));
        }
    }

    #[tokio::test]
    async fn records_events() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        recorder
            .on_event(AuditEvent::ToolExec {
                tool: "echo".to_string(),
                args: "hi".to_string(),
                status: ToolStatus::Success,
            })
            .await;
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
