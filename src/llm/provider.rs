//! Per-provider strategy records.
//!
//! All six providers converge on the OpenAI chat-completions wire body;
//! only the authentication header shape and the default endpoint differ.
//! Adding a provider means adding one match arm here.

use serde_json::{json, Value};

use crate::error::CoreError;

/// One role in a conversation turn, wire-serialized as the OpenAI-compatible
/// `role` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn wire(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single history turn handed to [`Provider::build_body`].
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// The six providers named in the Agent config's `provider` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    OpenRouter,
    Local,
    Zai,
}

impl Provider {
    pub fn default_api_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::Local => "http://127.0.0.1:11434/v1",
            Provider::Zai => "https://api.z.ai/api/paas/v4",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Anthropic => "claude-sonnet-4-5",
            Provider::Gemini => "gemini-2.0-flash",
            Provider::OpenRouter => "openrouter/auto",
            Provider::Local => "llama3",
            Provider::Zai => "glm-4.5",
        }
    }

    /// `(header name, header value)`. Anthropic alone uses a named-key
    /// header; everything else is bearer-style (Local's is optional but
    /// harmless to send when the key is empty).
    pub fn auth_header(self, api_key: &str) -> (&'static str, String) {
        match self {
            Provider::Anthropic => ("x-api-key", api_key.to_string()),
            _ => ("Authorization", format!("Bearer {api_key}")),
        }
    }

    /// Builds the OpenAI-compatible chat-completions wire body.
    pub fn build_body(
        self,
        model: &str,
        temperature: f64,
        max_tokens: u32,
        system_prompt: &str,
        history: &[Turn],
        user_input: &str,
    ) -> Value {
        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        messages.extend(history.iter().map(|t| json!({"role": t.role.wire(), "content": t.content})));
        messages.push(json!({"role": "user", "content": user_input}));
        json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": messages,
        })
    }

    /// Normalizes a parsed reply body into `choices[0].message.content`.
    /// All six providers are fronted with an OpenAI-compatible surface, so
    /// there is nothing provider-specific to normalize here today — this
    /// is the seam a future provider's diverging envelope would hook into.
    pub fn parse_content(self, body: &Value) -> Result<String, CoreError> {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::Parse {
                reason: "response missing choices[0].message.content".to_string(),
            })
    }

    pub fn parse_usage(self, body: &Value) -> (u64, u64) {
        let usage = body.get("usage");
        let input = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        (input, output)
    }

    pub fn name(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai-compatible",
            Provider::Anthropic => "anthropic-compatible",
            Provider::Gemini => "gemini-compatible",
            Provider::OpenRouter => "openrouter-compatible",
            Provider::Local => "local-compatible",
            Provider::Zai => "zai-compatible",
        }
    }

    pub fn from_config_str(s: &str) -> Option<Provider> {
        match s {
            "openai" | "OpenAI-compatible" => Some(Provider::OpenAi),
            "anthropic" | "Anthropic-compatible" => Some(Provider::Anthropic),
            "gemini" | "Gemini-compatible" => Some(Provider::Gemini),
            "openrouter" | "OpenRouter-compatible" => Some(Provider::OpenRouter),
            "local" | "Local-compatible" => Some(Provider::Local),
            "zai" | "ZAI-compatible" => Some(Provider::Zai),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_uses_named_key_header() {
        let (name, value) = Provider::Anthropic.auth_header("sk-test");
        assert_eq!(name, "x-api-key");
        assert_eq!(value, "sk-test");
    }

    #[test]
    fn openai_uses_bearer_header() {
        let (name, value) = Provider::OpenAi.auth_header("sk-test");
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer sk-test");
    }

    #[test]
    fn build_body_includes_system_and_user_turns() {
        let body = Provider::OpenAi.build_body("gpt-4o-mini", 0.7, 512, "be terse", &[], "hi");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages.last().unwrap()["role"], "user");
        assert_eq!(messages.last().unwrap()["content"], "hi");
    }

    #[test]
    fn parse_content_extracts_choice_text() {
        let body = json!({"choices": [{"message": {"content": "The capital is Paris."}}]});
        assert_eq!(
            Provider::OpenAi.parse_content(&body).unwrap(),
            "The capital is Paris."
        );
    }

    #[test]
    fn parse_content_errors_on_missing_shape() {
        let body = json!({"nope": true});
        assert!(Provider::OpenAi.parse_content(&body).is_err());
    }

    #[test]
    fn parse_usage_defaults_to_zero() {
        assert_eq!(Provider::OpenAi.parse_usage(&json!({})), (0, 0));
    }
}
