//! Mesh captain: node registry, capability-indexed least-loaded routing,
//! HTTP-JSON dispatch, stale-node sweep, broadcast.
//!
//! The HTTP surface is an `axum::Router` with per-route `Arc` clones
//! captured into closures rather than `axum::extract::State`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::error::CoreError;
use crate::event::{AuditEvent, EventHandler, NoopEventHandler};
use crate::llm::shared_http_client;
use crate::mesh::node::{MeshNode, MAX_CAPABILITIES, MAX_NAME_BYTES, MAX_NODES};
use crate::mesh::token;
use crate::shield;

/// `(task_id, success, output, node_name, latency_ms, error?)` — a mesh
/// dispatch result.
#[derive(Debug, Clone)]
pub struct MeshResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub node_name: String,
    pub latency_ms: u64,
    pub error: Option<String>,
}

pub struct Captain {
    nodes: DashMap<String, MeshNode>,
    order_counter: AtomicU64,
    secret: String,
    heartbeat_interval_ms: u64,
    event_handler: Arc<dyn EventHandler>,
}

impl Captain {
    pub fn new(secret: impl Into<String>, heartbeat_interval_ms: u64) -> Self {
        Captain {
            nodes: DashMap::new(),
            order_counter: AtomicU64::new(0),
            secret: secret.into(),
            heartbeat_interval_ms,
            event_handler: Arc::new(NoopEventHandler),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Either updates the existing entry (endpoint/capabilities refreshed,
    /// counters preserved) or appends; appending past [`MAX_NODES`] is
    /// rejected.
    pub fn register_node(
        &self,
        name: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: Vec<String>,
        now_ms: u64,
    ) -> Result<(), CoreError> {
        let name = name.into();
        if name.len() > MAX_NAME_BYTES {
            return Err(CoreError::InvalidInput {
                reason: format!("mesh node name exceeds {MAX_NAME_BYTES} bytes"),
            });
        }
        if capabilities.len() > MAX_CAPABILITIES {
            return Err(CoreError::InvalidInput {
                reason: format!("mesh node advertises more than {MAX_CAPABILITIES} capabilities"),
            });
        }

        if let Some(mut existing) = self.nodes.get_mut(&name) {
            existing.endpoint = endpoint.into();
            existing.capabilities = capabilities;
            existing.healthy = true;
            existing.last_heartbeat_ms = now_ms;
            return Ok(());
        }

        if self.nodes.len() >= MAX_NODES {
            return Err(CoreError::Full {
                what: "mesh registry".to_string(),
            });
        }

        let order = self.order_counter.fetch_add(1, Ordering::SeqCst);
        self.nodes.insert(
            name.clone(),
            MeshNode {
                name,
                endpoint: endpoint.into(),
                capabilities,
                healthy: true,
                last_heartbeat_ms: now_ms,
                registered_at_ms: now_ms,
                tasks_completed: 0,
                tasks_failed: 0,
                order,
            },
        );
        Ok(())
    }

    pub fn record_heartbeat(&self, name: &str, timestamp_ms: u64) -> bool {
        match self.nodes.get_mut(name) {
            Some(mut node) => {
                node.last_heartbeat_ms = timestamp_ms;
                node.healthy = true;
                true
            }
            None => false,
        }
    }

    /// Marks any node whose `last_heartbeat` is older than
    /// `3 × heartbeat_interval` unhealthy. Unhealthy nodes stay in the
    /// registry so their counters survive transient outages.
    pub fn sweep_stale(&self, now_ms: u64) {
        let threshold = 3 * self.heartbeat_interval_ms;
        for mut node in self.nodes.iter_mut() {
            if now_ms.saturating_sub(node.last_heartbeat_ms) > threshold {
                node.healthy = false;
            }
        }
    }

    /// Healthy nodes advertising `tool`, least-loaded first, ties broken by
    /// insertion order.
    fn capability_index(&self, tool: &str) -> Vec<MeshNode> {
        let mut candidates: Vec<MeshNode> = self
            .nodes
            .iter()
            .map(|e| e.value().clone())
            .filter(|n| n.healthy && n.has_capability(tool))
            .collect();
        candidates.sort_by_key(|n| (n.load(), n.order));
        candidates
    }

    /// Dispatches one task to the least-loaded healthy node advertising
    /// `tool`. The output is always run through the output-injection
    /// Shield before being handed back.
    pub async fn dispatch(
        &self,
        task_id: &str,
        tool: &str,
        args: &str,
        now_ms: u64,
    ) -> Result<MeshResult, CoreError> {
        self.sweep_stale(now_ms);
        let candidates = self.capability_index(tool);
        let Some(node) = candidates.into_iter().next() else {
            return Err(CoreError::NotFound {
                what: format!("healthy mesh node for tool '{tool}'"),
            });
        };

        let start = std::time::Instant::now();
        let url = format!("{}/node/exec", node.endpoint.trim_end_matches('/'));
        let body = json!({"task_id": task_id, "tool": tool, "args": args});

        let outcome = shared_http_client()
            .post(&url)
            .header("Authorization", format!("Bearer {}", token::mint(&self.secret)))
            .json(&body)
            .send()
            .await;

        let latency_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(parsed) => {
                        let mut output = parsed
                            .get("output")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let mut success = parsed
                            .get("success")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(true);
                        if shield::detect_output_injection(output.as_bytes()) {
                            warn!("mesh node '{}' output flagged by output Shield", node.name);
                            output = "[output withheld by safety filter]".to_string();
                            success = false;
                        }
                        MeshResult {
                            task_id: task_id.to_string(),
                            success,
                            output,
                            node_name: node.name.clone(),
                            latency_ms,
                            error: None,
                        }
                    }
                    Err(e) => MeshResult {
                        task_id: task_id.to_string(),
                        success: false,
                        output: String::new(),
                        node_name: node.name.clone(),
                        latency_ms,
                        error: Some(format!("malformed response: {e}")),
                    },
                }
            }
            Ok(response) => MeshResult {
                task_id: task_id.to_string(),
                success: false,
                output: String::new(),
                node_name: node.name.clone(),
                latency_ms,
                error: Some(format!("node returned HTTP {}", response.status())),
            },
            Err(e) => MeshResult {
                task_id: task_id.to_string(),
                success: false,
                output: String::new(),
                node_name: node.name.clone(),
                latency_ms,
                error: Some(format!("dispatch failed: {e}")),
            },
        };

        if let Some(mut entry) = self.nodes.get_mut(&node.name) {
            if result.success {
                entry.tasks_completed += 1;
            } else {
                entry.tasks_failed += 1;
            }
        }

        self.event_handler
            .on_event(AuditEvent::MeshDispatch {
                task_id: task_id.to_string(),
                tool: tool.to_string(),
                node: node.name.clone(),
                success: result.success,
            })
            .await;

        Ok(result)
    }

    /// Convenience over [`Self::dispatch`] for callers that have no
    /// existing task id of their own; mints one with `Uuid::new_v4()`.
    pub async fn dispatch_new_task(
        &self,
        tool: &str,
        args: &str,
        now_ms: u64,
    ) -> Result<MeshResult, CoreError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.dispatch(&task_id, tool, args, now_ms).await
    }

    /// Fire-and-forget broadcast to every healthy node; returns the count
    /// of successful deliveries.
    pub async fn broadcast(&self, message: &str) -> usize {
        let healthy: Vec<MeshNode> = self
            .nodes
            .iter()
            .map(|e| e.value().clone())
            .filter(|n| n.healthy)
            .collect();
        let mut successes = 0;
        for node in healthy {
            let url = format!("{}/mesh/broadcast", node.endpoint.trim_end_matches('/'));
            let result = shared_http_client()
                .post(&url)
                .json(&json!({"message": message}))
                .send()
                .await;
            if matches!(result, Ok(r) if r.status().is_success()) {
                successes += 1;
            }
        }
        successes
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: String,
    endpoint: String,
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    name: String,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct BroadcastBody {
    message: String,
}

/// Builds the Captain's `axum::Router`: `/mesh/register`, `/mesh/heartbeat`,
/// `/mesh/broadcast`, and `/node/exec` are all handled by *this* process
/// only when it is itself addressed as a Crew target (e.g. in tests); in
/// the common topology `/node/exec` is served by the Crew binary, not the
/// Captain. It is included here so a single process can act as both roles.
pub fn router(captain: Arc<Captain>) -> Router {
    let register_captain = captain.clone();
    let heartbeat_captain = captain.clone();
    let broadcast_captain = captain.clone();

    Router::new()
        .route(
            "/mesh/register",
            post(
                move |ConnectInfo(_addr): ConnectInfo<SocketAddr>, Json(body): Json<RegisterBody>| {
                    let captain = register_captain.clone();
                    async move {
                        match captain.register_node(
                            body.name,
                            body.endpoint,
                            body.capabilities,
                            token::now_ms(),
                        ) {
                            Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
                            Err(e) => (
                                StatusCode::BAD_REQUEST,
                                Json(json!({"error": e.to_string()})),
                            )
                                .into_response(),
                        }
                    }
                },
            ),
        )
        .route(
            "/mesh/heartbeat",
            post(move |Json(body): Json<HeartbeatBody>| {
                let captain = heartbeat_captain.clone();
                async move {
                    if captain.record_heartbeat(&body.name, body.timestamp) {
                        (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
                    } else {
                        (
                            StatusCode::NOT_FOUND,
                            Json(json!({"error": format!("unknown node '{}'", body.name)})),
                        )
                            .into_response()
                    }
                }
            }),
        )
        .route(
            "/mesh/broadcast",
            post(move |Json(body): Json<BroadcastBody>| {
                let captain = broadcast_captain.clone();
                async move {
                    let delivered = captain.broadcast(&body.message).await;
                    info!("broadcast delivered to {delivered} nodes");
                    (StatusCode::OK, Json(json!({"delivered": delivered}))).into_response()
                }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captain() -> Captain {
        Captain::new("shared-secret", 30_000)
    }

    #[test]
    fn register_then_heartbeat_keeps_node_healthy() {
        let captain = captain();
        captain.register_node("a", "http://a", vec!["file_read".to_string()], 1_000).unwrap();
        assert!(captain.record_heartbeat("a", 2_000));
        assert_eq!(captain.node_count(), 1);
    }

    #[test]
    fn sweep_marks_stale_node_unhealthy_but_keeps_it() {
        let captain = captain();
        captain.register_node("a", "http://a", vec![], 0).unwrap();
        captain.sweep_stale(30_000 * 3 + 1);
        assert_eq!(captain.node_count(), 1);
        let candidates = captain.capability_index("anything");
        assert!(candidates.is_empty());
    }

    #[test]
    fn capability_index_picks_least_loaded() {
        let captain = captain();
        captain
            .register_node("a", "http://a", vec!["file_read".to_string(), "shell_exec".to_string()], 0)
            .unwrap();
        captain.register_node("b", "http://b", vec!["file_read".to_string()], 0).unwrap();
        {
            let mut a = captain.nodes.get_mut("a").unwrap();
            a.tasks_completed = 2;
        }
        let candidates = captain.capability_index("file_read");
        assert_eq!(candidates[0].name, "b");
    }

    #[test]
    fn registry_rejects_past_max_nodes() {
        let captain = captain();
        for i in 0..MAX_NODES {
            captain
                .register_node(format!("n{i}"), "http://x", vec![], 0)
                .unwrap();
        }
        let err = captain.register_node("overflow", "http://x", vec![], 0).unwrap_err();
        assert!(matches!(err, CoreError::Full { .. }));
    }
}
