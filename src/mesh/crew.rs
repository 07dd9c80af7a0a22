//! Mesh crew: registers with a captain, sends heartbeats, and serves
//! `/node/exec` against the local tool registry.
//!
//! The registration/heartbeat calls reuse the same pooled `reqwest::Client`
//! style the provider adapter uses; the `/node/exec` router follows
//! `mesh::captain::router`'s own per-route `Arc`-clone idiom.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use log::warn;
use serde::Deserialize;
use serde_json::json;

use crate::error::CoreError;
use crate::llm::shared_http_client;
use crate::mesh::token;
use crate::tools::ToolRegistry;

pub struct Crew {
    name: String,
    self_endpoint: String,
    captain_url: String,
    capabilities: Vec<String>,
    secret: String,
    registry: Arc<ToolRegistry>,
}

impl Crew {
    pub fn new(
        name: impl Into<String>,
        self_endpoint: impl Into<String>,
        captain_url: impl Into<String>,
        capabilities: Vec<String>,
        secret: impl Into<String>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Crew {
            name: name.into(),
            self_endpoint: self_endpoint.into(),
            captain_url: captain_url.into(),
            capabilities,
            secret: secret.into(),
            registry,
        }
    }

    /// `register(captain_url, self_endpoint, capabilities[])`: posts a
    /// registration document to the Captain.
    pub async fn register(&self) -> Result<(), CoreError> {
        let url = format!("{}/mesh/register", self.captain_url.trim_end_matches('/'));
        let body = json!({
            "name": self.name,
            "endpoint": self.self_endpoint,
            "capabilities": self.capabilities,
        });
        let response = shared_http_client()
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Connect {
                reason: format!("registering with captain at {url}: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(CoreError::Connect {
                reason: format!("captain rejected registration: HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    /// `heartbeat()`: posts `{name, timestamp}` to the Captain. Intended to
    /// be called on a periodic interval by the owning worker.
    pub async fn heartbeat(&self) -> Result<(), CoreError> {
        let url = format!("{}/mesh/heartbeat", self.captain_url.trim_end_matches('/'));
        let body = json!({"name": self.name, "timestamp": token::now_ms()});
        let response = shared_http_client()
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Connect {
                reason: format!("heartbeat to captain at {url}: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(CoreError::Connect {
                reason: format!("captain rejected heartbeat: HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    /// Builds the Crew's `axum::Router`, serving `POST /node/exec` gated by
    /// the shared-secret mesh token.
    pub fn router(self: Arc<Self>) -> Router {
        let crew = self.clone();
        Router::new().route(
            "/node/exec",
            post(move |headers: HeaderMap, Json(body): Json<ExecBody>| {
                let crew = crew.clone();
                async move { crew.handle_exec(headers, body).await }
            }),
        )
    }

    async fn handle_exec(&self, headers: HeaderMap, body: ExecBody) -> axum::response::Response {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| token::verify(t, &self.secret))
            .unwrap_or(false);
        if !authorized {
            warn!("mesh node '{}' rejected unauthenticated /node/exec request", self.name);
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid or missing mesh token"})),
            )
                .into_response();
        }

        match self.registry.dispatch(&body.tool, &body.args).await {
            Ok(output) => (StatusCode::OK, Json(json!({"output": output, "success": true})))
                .into_response(),
            Err(e) => (
                StatusCode::OK,
                Json(json!({"output": "", "success": false, "error": e.to_string()})),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecBody {
    #[allow(dead_code)]
    task_id: String,
    tool: String,
    args: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::EchoTool;

    fn crew_with_echo() -> Arc<Crew> {
        let mut registry = ToolRegistry::new(8);
        registry.register("echo", "returns its argument", Arc::new(EchoTool)).unwrap();
        Arc::new(Crew::new(
            "crew-a",
            "http://127.0.0.1:9001",
            "http://127.0.0.1:9000",
            vec!["echo".to_string()],
            "shared-secret",
            Arc::new(registry),
        ))
    }

    #[tokio::test]
    async fn handle_exec_rejects_missing_auth() {
        let crew = crew_with_echo();
        let response = crew
            .handle_exec(
                HeaderMap::new(),
                ExecBody {
                    task_id: "t1".to_string(),
                    tool: "echo".to_string(),
                    args: "hi".to_string(),
                },
            )
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn handle_exec_dispatches_with_valid_token() {
        let crew = crew_with_echo();
        let mut headers = HeaderMap::new();
        let token_value = token::mint("shared-secret");
        headers.insert(
            "authorization",
            format!("Bearer {token_value}").parse().unwrap(),
        );
        let response = crew
            .handle_exec(
                headers,
                ExecBody {
                    task_id: "t1".to_string(),
                    tool: "echo".to_string(),
                    args: "hi".to_string(),
                },
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
