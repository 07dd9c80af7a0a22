//! LLM proxy: a loopback HTTPS-capable endpoint presenting an
//! LLM-provider-compatible surface to internal clients, gated by a bearer
//! token and a per-caller daily budget.
//!
//! The raw socket loop handles one connection at a time on a single accept
//! loop, rather than fronting it with `axum`. The bearer check uses a
//! constant-time-compare idiom (`sha2` digest + `subtle::ConstantTimeEq`)
//! instead of `==`.

use std::time::{Duration, Instant};

use log::{error, info, warn};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::error::CoreError;
use crate::event::{AuditEvent, EventHandler, NoopEventHandler};
use crate::llm::{shared_http_client, Provider, ProviderConfig};
use crate::region::Region;
use crate::store::DurableStore;

/// Headers: 8 KiB. Body: 256 KiB.
const MAX_HEADER_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: usize = 256 * 1024;
/// Per-connection region size.
const PROXY_REGION_BYTES: usize = 512 * 1024;
/// Socket read timeout.
const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Proxy {
    config: AgentConfig,
    store: Arc<dyn DurableStore>,
    event_handler: Arc<dyn EventHandler>,
    service_name: String,
}

struct ParsedRequest {
    method: String,
    path: String,
    bearer: Option<String>,
    body: Vec<u8>,
}

impl Proxy {
    pub fn new(config: AgentConfig, store: Arc<dyn DurableStore>) -> Self {
        Proxy {
            config,
            store,
            event_handler: Arc::new(NoopEventHandler),
            service_name: "coreagent-proxy".to_string(),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Binds `127.0.0.1:<proxy_port>` and serves connections one at a time,
    /// to completion, forever. Runs on its own worker, distinct from the
    /// agent loop.
    pub async fn run(&self) -> Result<(), CoreError> {
        let addr = format!("127.0.0.1:{}", self.config.proxy_port);
        let listener = TcpListener::bind(&addr).await.map_err(CoreError::from)?;
        info!("llm proxy listening on {addr}");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("proxy accept failed: {e}");
                    continue;
                }
            };
            if let Err(e) = self.handle_connection(stream).await {
                warn!("proxy connection from {peer} failed: {e}");
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), CoreError> {
        let request = match timeout(SOCKET_READ_TIMEOUT, read_request(&mut stream)).await {
            Ok(Ok(req)) => req,
            Ok(Err(e)) => {
                write_error(&mut stream, 400, "bad request", &e.to_string()).await?;
                return Ok(());
            }
            Err(_) => {
                write_error(&mut stream, 408, "request timeout", "socket read timeout").await?;
                return Ok(());
            }
        };

        match (request.method.as_str(), request.path.as_str()) {
            ("OPTIONS", _) => write_options(&mut stream).await,
            ("GET", "/health") => write_health(&mut stream, &self.service_name).await,
            ("POST", "/v1/chat/completions") | ("POST", "/chat/completions") => {
                self.handle_chat_completions(&mut stream, request).await
            }
            _ => write_error(&mut stream, 404, "not found", "no such route").await,
        }
    }

    async fn handle_chat_completions(
        &self,
        stream: &mut TcpStream,
        request: ParsedRequest,
    ) -> Result<(), CoreError> {
        if !self.authorized(request.bearer.as_deref()) {
            self.event_handler
                .on_event(AuditEvent::ProxyAuthFailure {
                    caller_hint: self.config.proxy_caller.clone(),
                })
                .await;
            self.store
                .log_event("auth_failure", &self.config.proxy_caller, "bearer mismatch")
                .await?;
            return write_error(stream, 401, "unauthorized", "invalid bearer token").await;
        }

        if self.config.daily_token_budget > 0 {
            let used = self.store.llm_total_tokens(&self.config.proxy_caller).await?;
            if used >= self.config.daily_token_budget {
                self.event_handler
                    .on_event(AuditEvent::ProxyBudgetExceeded {
                        caller: self.config.proxy_caller.clone(),
                        budget: self.config.daily_token_budget,
                    })
                    .await;
                self.store
                    .log_event("budget_exceeded", &self.config.proxy_caller, &used.to_string())
                    .await?;
                return write_error(stream, 429, "too many requests", "daily token budget exceeded")
                    .await;
            }
        }

        let region = Region::create(PROXY_REGION_BYTES);
        let body_str = match std::str::from_utf8(&request.body) {
            Ok(s) => region.push_str(s)?,
            Err(_) => {
                return write_error(stream, 400, "bad request", "body was not valid UTF-8").await
            }
        };

        let upstream = self.upstream_provider()?;
        let (auth_name, auth_value) = upstream.provider.auth_header(&upstream.api_key);
        let url = format!("{}/chat/completions", upstream.api_url.trim_end_matches('/'));

        let start = Instant::now();
        let outcome = shared_http_client()
            .post(&url)
            .header(auth_name, auth_value)
            .header("Content-Type", "application/json")
            .body(body_str.to_string())
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let (tokens_in, tokens_out) = serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .map(|v| upstream.provider.parse_usage(&v))
                    .unwrap_or((0, 0));
                self.store
                    .llm_log(
                        &self.config.proxy_caller,
                        upstream.provider.name(),
                        &upstream.model,
                        tokens_in,
                        tokens_out,
                        0.0,
                        latency_ms,
                        &status.to_string(),
                        "",
                    )
                    .await?;
                write_json_passthrough(stream, status, &text).await
            }
            Err(e) => {
                error!("proxy upstream request to {url} failed: {e}");
                self.store
                    .llm_log(
                        &self.config.proxy_caller,
                        upstream.provider.name(),
                        &upstream.model,
                        0,
                        0,
                        0.0,
                        latency_ms,
                        "error",
                        &e.to_string(),
                    )
                    .await?;
                write_error(stream, 502, "bad gateway", "upstream request failed").await
            }
        }
    }

    fn authorized(&self, bearer: Option<&str>) -> bool {
        let Some(provided) = bearer else {
            return false;
        };
        let expected_hash = Sha256::digest(self.config.proxy_token.as_bytes());
        let provided_hash = Sha256::digest(provided.as_bytes());
        expected_hash.ct_eq(&provided_hash).into()
    }

    fn upstream_provider(&self) -> Result<ProviderConfig, CoreError> {
        let provider = self.config.provider()?;
        Ok(ProviderConfig {
            provider,
            api_url: self
                .config
                .llm_api_url
                .clone()
                .unwrap_or_else(|| provider.default_api_url().to_string()),
            api_key: self.config.llm_api_key.clone(),
            model: self
                .config
                .llm_model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string()),
        })
    }
}

/// Reads bytes until `\r\n\r\n`, then (if `Content-Length` is present)
/// continues until that many body bytes have arrived. Enforces the
/// 8 KiB header / 256 KiB body ceilings.
async fn read_request(stream: &mut TcpStream) -> Result<ParsedRequest, CoreError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_terminator(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(CoreError::InvalidInput {
                reason: "request headers exceeded 8 KiB".to_string(),
            });
        }
        let n = stream.read(&mut chunk).await.map_err(CoreError::from)?;
        if n == 0 {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers completed",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut bearer = None;
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key == "content-length" {
            content_length = value.parse().unwrap_or(0);
        } else if key == "authorization" {
            bearer = value.strip_prefix("Bearer ").map(|t| t.to_string());
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Err(CoreError::InvalidInput {
            reason: "request body exceeded 256 KiB".to_string(),
        });
    }

    let body_start = header_end + 4; // skip "\r\n\r\n"
    while buf.len() - body_start < content_length {
        let n = stream.read(&mut chunk).await.map_err(CoreError::from)?;
        if n == 0 {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() - body_start > MAX_BODY_BYTES {
            return Err(CoreError::InvalidInput {
                reason: "request body exceeded 256 KiB".to_string(),
            });
        }
    }

    let body = buf[body_start..body_start + content_length].to_vec();
    Ok(ParsedRequest {
        method,
        path,
        bearer,
        body,
    })
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    headers: &[(&str, String)],
    body: &str,
) -> Result<(), CoreError> {
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    response.push_str(body);
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(CoreError::from)
}

async fn write_health(stream: &mut TcpStream, service: &str) -> Result<(), CoreError> {
    let body = serde_json::json!({"status": "ok", "service": service}).to_string();
    write_response(
        stream,
        200,
        "OK",
        &[("Content-Type", "application/json".to_string())],
        &body,
    )
    .await
}

async fn write_options(stream: &mut TcpStream) -> Result<(), CoreError> {
    write_response(
        stream,
        204,
        "No Content",
        &[
            ("Access-Control-Allow-Origin", "*".to_string()),
            ("Access-Control-Allow-Methods", "POST, GET, OPTIONS".to_string()),
            ("Access-Control-Allow-Headers", "Authorization, Content-Type".to_string()),
        ],
        "",
    )
    .await
}

/// Error bodies: `{"error":{"message":<string>,"type":"proxy_error","code":<int>}}`
async fn write_error(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    message: &str,
) -> Result<(), CoreError> {
    let body = serde_json::json!({
        "error": {"message": message, "type": "proxy_error", "code": status}
    })
    .to_string();
    write_response(
        stream,
        status,
        reason,
        &[("Content-Type", "application/json".to_string())],
        &body,
    )
    .await
}

async fn write_json_passthrough(stream: &mut TcpStream, status: u16, body: &str) -> Result<(), CoreError> {
    let reason = match status {
        200 => "OK",
        _ => "",
    };
    write_response(
        stream,
        status,
        reason,
        &[("Content-Type", "application/json".to_string())],
        body,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AgentConfig {
        let mut config: AgentConfig = serde_json::from_str(
            r#"{
                "llm_provider": "openai",
                "llm_api_key": "sk-test",
                "llm_api_url": null,
                "llm_model": "gpt-4o-mini",
                "proxy_token": "internal-secret"
            }"#,
        )
        .unwrap();
        config.daily_token_budget = 0;
        config
    }

    #[test]
    fn authorized_accepts_matching_token() {
        let proxy = Proxy::new(sample_config(), Arc::new(crate::store::InMemoryStore::new()));
        assert!(proxy.authorized(Some("internal-secret")));
    }

    #[test]
    fn authorized_rejects_mismatched_token() {
        let proxy = Proxy::new(sample_config(), Arc::new(crate::store::InMemoryStore::new()));
        assert!(!proxy.authorized(Some("wrong")));
    }

    #[test]
    fn authorized_rejects_missing_token() {
        let proxy = Proxy::new(sample_config(), Arc::new(crate::store::InMemoryStore::new()));
        assert!(!proxy.authorized(None));
    }

    #[test]
    fn finds_header_terminator() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody";
        assert!(find_header_terminator(buf).is_some());
    }

    #[tokio::test]
    async fn budget_exceeded_blocks_before_upstream_call() {
        let mut config = sample_config();
        config.daily_token_budget = 1000;
        let store = Arc::new(crate::store::InMemoryStore::new());
        store
            .llm_log("agent-zero", "openai", "gpt", 1000, 0, 0.0, 1, "200", "")
            .await
            .unwrap();
        let proxy = Proxy::new(config, store.clone());
        let used = store.llm_total_tokens("agent-zero").await.unwrap();
        assert!(used >= proxy.config.daily_token_budget);
    }
}
