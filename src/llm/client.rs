//! Provider call + fallback chain: one pooled, lazily-initialized
//! `reqwest::Client` shared by every call, and a single function that
//! posts the wire body, checks status, and pulls `content`/`usage` out of
//! the parsed reply.

use std::time::Duration;

use futures_util::StreamExt;
use lazy_static::lazy_static;
use log::{error, warn};

use crate::error::CoreError;
use crate::llm::provider::{Provider, Turn};

/// Invoked once per SSE delta; returning `false` cancels the request
/// cleanly.
pub trait StreamCallback: Send + Sync {
    fn on_delta(&self, delta: &str) -> bool;
}

impl<F: Fn(&str) -> bool + Send + Sync> StreamCallback for F {
    fn on_delta(&self, delta: &str) -> bool {
        self(delta)
    }
}

lazy_static! {
    /// Shared HTTP client with persistent connection pooling. Default
    /// timeouts: 120s total, 10s connect.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build shared HTTP client");
}

pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// One provider entry, either the primary selection or one fallback slot
/// from `llm_fallbacks[≤4]`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub provider_name: &'static str,
}

/// Calls one provider's chat-completions endpoint. Success is an HTTP 200
/// with a parseable body; anything else is surfaced as a `Connect` or
/// `Parse` error for the fallback chain to act on.
pub async fn call_provider(
    cfg: &ProviderConfig,
    temperature: f64,
    max_tokens: u32,
    system_prompt: &str,
    history: &[Turn],
    user_input: &str,
) -> Result<ChatResponse, CoreError> {
    let body = cfg.provider.build_body(
        &cfg.model,
        temperature,
        max_tokens,
        system_prompt,
        history,
        user_input,
    );
    let (header_name, header_value) = cfg.provider.auth_header(&cfg.api_key);
    let url = format!("{}/chat/completions", cfg.api_url.trim_end_matches('/'));

    let response = shared_http_client()
        .post(&url)
        .header(header_name, header_value)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| CoreError::Connect {
            reason: format!("{} ({url}): {e}", cfg.provider.name()),
        })?;

    let status = response.status();
    let text = response.text().await.map_err(|e| CoreError::Connect {
        reason: format!("{} ({url}): reading body: {e}", cfg.provider.name()),
    })?;

    if !status.is_success() {
        warn!("provider {} returned HTTP {status}: {text}", cfg.provider.name());
        return Err(CoreError::Connect {
            reason: format!("{} returned HTTP {status}", cfg.provider.name()),
        });
    }

    let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| CoreError::Parse {
        reason: format!("{} reply was not JSON: {e}", cfg.provider.name()),
    })?;

    let content = cfg.provider.parse_content(&parsed)?;
    let (tokens_in, tokens_out) = cfg.provider.parse_usage(&parsed);

    Ok(ChatResponse {
        content,
        tokens_in,
        tokens_out,
        provider_name: cfg.provider.name(),
    })
}

/// Like [`call_provider`] but streams the reply as Server-Sent-Events,
/// invoking `callback` with each incremental delta as it arrives. The
/// full reply text is still assembled
/// and returned so the caller can run it through output Shield
/// validation exactly as with the non-streaming path. If `callback`
/// returns `false`, the stream is dropped and `CoreError::Connect` is
/// returned naming the provider.
pub async fn call_provider_streaming(
    cfg: &ProviderConfig,
    temperature: f64,
    max_tokens: u32,
    system_prompt: &str,
    history: &[Turn],
    user_input: &str,
    callback: &dyn StreamCallback,
) -> Result<ChatResponse, CoreError> {
    let mut body = cfg.provider.build_body(
        &cfg.model,
        temperature,
        max_tokens,
        system_prompt,
        history,
        user_input,
    );
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream".to_string(), serde_json::Value::Bool(true));
    }
    let (header_name, header_value) = cfg.provider.auth_header(&cfg.api_key);
    let url = format!("{}/chat/completions", cfg.api_url.trim_end_matches('/'));

    let response = shared_http_client()
        .post(&url)
        .header(header_name, header_value)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| CoreError::Connect {
            reason: format!("{} ({url}): {e}", cfg.provider.name()),
        })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        warn!("provider {} returned HTTP {status}: {text}", cfg.provider.name());
        return Err(CoreError::Connect {
            reason: format!("{} returned HTTP {status}", cfg.provider.name()),
        });
    }

    let mut stream = response.bytes_stream();
    let mut line_buf = String::new();
    let mut full_content = String::new();
    let mut tokens_in = 0u64;
    let mut tokens_out = 0u64;

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CoreError::Connect {
            reason: format!("{} ({url}): reading stream: {e}", cfg.provider.name()),
        })?;
        line_buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline_at) = line_buf.find('\n') {
            let line = line_buf[..newline_at].trim_end_matches('\r').to_string();
            line_buf.drain(..=newline_at);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break 'outer;
            }

            let parsed: serde_json::Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!("{}: skipping unparseable SSE frame: {e}", cfg.provider.name());
                    continue;
                }
            };

            let delta = parsed
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or("");
            if !delta.is_empty() {
                full_content.push_str(delta);
                if !callback.on_delta(delta) {
                    return Err(CoreError::Connect {
                        reason: format!("{}: request cancelled by callback", cfg.provider.name()),
                    });
                }
            }

            if let Some(usage) = parsed.get("usage") {
                let (i, o) = cfg.provider.parse_usage(&json_with_usage(usage));
                tokens_in = i;
                tokens_out = o;
            }
        }
    }

    Ok(ChatResponse {
        content: full_content,
        tokens_in,
        tokens_out,
        provider_name: cfg.provider.name(),
    })
}

/// Wraps a bare `usage` object back under a `{"usage": ...}` envelope so
/// it can be run through [`Provider::parse_usage`], which expects the
/// shape of a full chat-completions reply rather than a lone usage
/// object.
fn json_with_usage(usage: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "usage": usage })
}

/// Tries `primary` then each of `fallbacks` in order; returns the first
/// success. If every entry fails, returns a single `Connect` error whose
/// message names the last provider tried.
pub async fn call_with_fallback(
    primary: &ProviderConfig,
    fallbacks: &[ProviderConfig],
    temperature: f64,
    max_tokens: u32,
    system_prompt: &str,
    history: &[Turn],
    user_input: &str,
) -> Result<ChatResponse, CoreError> {
    let mut last_err = None;
    for cfg in std::iter::once(primary).chain(fallbacks.iter()) {
        match call_provider(cfg, temperature, max_tokens, system_prompt, history, user_input).await
        {
            Ok(response) => return Ok(response),
            Err(e) => {
                error!("provider {} failed: {e}", cfg.provider.name());
                last_err = Some((cfg.provider.name(), e));
            }
        }
    }
    match last_err {
        Some((name, _)) => Err(CoreError::Connect {
            reason: format!("all providers failed; last tried: {name}"),
        }),
        None => Err(CoreError::Connect {
            reason: "no providers configured".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::Provider;

    fn cfg(provider: Provider, api_url: &str) -> ProviderConfig {
        ProviderConfig {
            provider,
            api_url: api_url.to_string(),
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
        }
    }

    #[tokio::test]
    async fn unreachable_primary_surfaces_connect_error() {
        let primary = cfg(Provider::OpenAi, "http://127.0.0.1:1");
        let err = call_provider(&primary, 0.5, 128, "sys", &[], "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Connect { .. }));
    }

    #[tokio::test]
    async fn streaming_call_surfaces_connect_error_on_unreachable_host() {
        let primary = cfg(Provider::OpenAi, "http://127.0.0.1:1");
        let callback = |_: &str| true;
        let err = call_provider_streaming(&primary, 0.5, 128, "sys", &[], "hi", &callback)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Connect { .. }));
    }

    #[tokio::test]
    async fn fallback_chain_names_last_provider_when_all_fail() {
        let primary = cfg(Provider::OpenAi, "http://127.0.0.1:1");
        let fallback = cfg(Provider::Anthropic, "http://127.0.0.1:2");
        let err = call_with_fallback(&primary, &[fallback], 0.5, 128, "sys", &[], "hi")
            .await
            .unwrap_err();
        match err {
            CoreError::Connect { reason } => assert!(reason.contains("anthropic-compatible")),
            _ => panic!("expected Connect error"),
        }
    }
}
