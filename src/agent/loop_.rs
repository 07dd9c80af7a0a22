//! The agent loop: the core orchestration state machine.
//!
//! `AssemblePrompt → CallProvider → ParseResponse → (ExecuteTool →
//! CallProvider)* → Finalize`. The persona-prefix + tool-bullet-list prompt
//! shape, the brace-counting tool-call extraction, and the "tool failure
//! becomes next-round prompt text" recovery policy all follow the same
//! pattern throughout.

use std::sync::Arc;

use log::{info, warn};

use crate::agent::session::{ConversationMessage, ExtraHistory};
use crate::config::AgentConfig;
use crate::document;
use crate::error::CoreError;
use crate::event::{AuditEvent, EventHandler, NoopEventHandler, ToolStatus};
use crate::llm::{self, Provider, ProviderConfig, StreamCallback};
use crate::region::Region;
use crate::shield::{self, Grammar};
use crate::store::DurableStore;
use crate::tools::ToolRegistry;

/// Returned to the chat bridge verbatim when the output Shield flags the
/// model's final text.
pub const OUTPUT_REFUSAL_TEXT: &str =
    "I can't return that response — it was flagged by the output safety check.";

/// A directive extracted from the model's reply:
/// `{"tool_call":{"name":"...","args":"..."}}`.
struct ToolCallDirective {
    name: String,
    args: String,
}

/// One handled-message region budget: small, since only the tool-call
/// fragment and the unescape pass live here (the bulk of the prompt is
/// built as owned `String`s so it survives the `.await` boundary to the
/// provider call — arenas are never shared across tasks).
const PARSE_REGION_BYTES: usize = 64 * 1024;

pub struct AgentLoop {
    config: AgentConfig,
    registry: ToolRegistry,
    store: Arc<dyn DurableStore>,
    event_handler: Arc<dyn EventHandler>,
}

impl AgentLoop {
    pub fn new(config: AgentConfig, registry: ToolRegistry, store: Arc<dyn DurableStore>) -> Self {
        AgentLoop {
            config,
            registry,
            store,
            event_handler: Arc::new(NoopEventHandler),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// The chat bridge receives either a valid textual answer or a single
    /// line beginning with `"Error: "`. Output-Shield
    /// refusals are a third, successful-but-refused case and are returned
    /// as [`OUTPUT_REFUSAL_TEXT`] verbatim.
    pub async fn handle_message(&self, user_input: &str) -> String {
        match self.run(user_input, None).await {
            Ok(text) => text,
            Err(e) => crate::error::user_visible(&e),
        }
    }

    /// Like [`Self::handle_message`], but streams each provider round's
    /// reply to `callback` as it arrives.
    /// Tool-call rounds still stream their intermediate text; only the
    /// final round's text is subject to output-Shield finalization, same
    /// as the non-streaming path.
    pub async fn handle_message_streaming(
        &self,
        user_input: &str,
        callback: &dyn StreamCallback,
    ) -> String {
        match self.run(user_input, Some(callback)).await {
            Ok(text) => text,
            Err(e) => crate::error::user_visible(&e),
        }
    }

    async fn run(
        &self,
        user_input: &str,
        stream_callback: Option<&dyn StreamCallback>,
    ) -> Result<String, CoreError> {
        let system_prompt = self.assemble_system_prompt(user_input).await?;
        let providers = self.provider_chain()?;
        let (temperature, max_tokens) = self.config.effective_generation_params();

        let mut history = ExtraHistory::new();
        let mut rounds = 0u32;

        loop {
            let response = match stream_callback {
                Some(callback) => {
                    self.call_with_fallback_streaming(
                        &providers,
                        temperature,
                        max_tokens,
                        &system_prompt,
                        &history.as_turns(),
                        user_input,
                        callback,
                    )
                    .await?
                }
                None => {
                    llm::call_with_fallback(
                        &providers[0],
                        &providers[1..],
                        temperature,
                        max_tokens,
                        &system_prompt,
                        &history.as_turns(),
                        user_input,
                    )
                    .await?
                }
            };

            info!(
                "provider {} answered ({} tokens in, {} tokens out)",
                response.provider_name, response.tokens_in, response.tokens_out
            );

            match self.extract_tool_call(&response.content)? {
                Some(directive) => {
                    if rounds >= self.config.max_tool_rounds {
                        return Err(CoreError::Timeout {
                            reason: format!(
                                "round cap ({}) reached with an outstanding tool call",
                                self.config.max_tool_rounds
                            ),
                        });
                    }
                    rounds += 1;

                    if let Err(e) =
                        shield::enforce(directive.name.as_bytes(), Grammar::Command, "tool call")
                    {
                        warn!("fatal dispatch short-circuit: {e}");
                        return Err(e);
                    }

                    history.push(ConversationMessage::assistant(response.content.clone()));

                    let tool_text = match self.registry.dispatch(&directive.name, &directive.args).await {
                        Ok(output) => output,
                        Err(e) => format!("Tool '{}' failed with error: {e}", directive.name),
                    };
                    history.push(ConversationMessage::tool_result(&directive.name, &tool_text));
                    history.push(ConversationMessage::user(format!(
                        "Tool '{}' returned: {tool_text}\nFinalize your answer for the user based on this result.",
                        directive.name
                    )));
                    continue;
                }
                None => {
                    return self.finalize(response.content).await;
                }
            }
        }
    }

    /// Fragments, in order: (1) persona prefix naming the tool-call
    /// contract; (2) tool descriptors in id order as a bullet list; (3) an
    /// optional persisted identity fragment; (4) a memory-context
    /// paragraph from the top-k relevant recall facts.
    async fn assemble_system_prompt(&self, user_input: &str) -> Result<String, CoreError> {
        let mut prompt = String::from(
            "You are an autonomous assistant. When you need a capability beyond plain \
             text, respond with a JSON fragment of the exact shape \
             {\"tool_call\":{\"name\":\"<tool>\",\"args\":\"<argument string>\"}} \
             anywhere in your reply; only the first such fragment is honored.\n\n\
             Available tools:\n",
        );
        for descriptor in self.registry.list_by_id() {
            prompt.push_str(&format!("- {}: {}\n", descriptor.name, descriptor.description));
        }

        if let Some(identity) = self.store.read_bootstrap("identity.md").await? {
            prompt.push_str("\nIdentity:\n");
            prompt.push_str(&identity);
            prompt.push('\n');
        }

        let facts = self.store.recall_query(user_input, 5).await?;
        if !facts.is_empty() {
            prompt.push_str("\nRelevant memory:\n");
            for fact in facts {
                prompt.push_str(&format!("- {}\n", fact.content));
            }
        }

        Ok(prompt)
    }

    /// Streaming counterpart of `llm::call_with_fallback`: tries each
    /// provider config in order, streaming deltas from the first one that
    /// accepts the connection. Fallback providers are retried without
    /// streaming re-enabled mid-chain is unnecessary here since only one
    /// provider ever ends up answering.
    async fn call_with_fallback_streaming(
        &self,
        providers: &[ProviderConfig],
        temperature: f64,
        max_tokens: u32,
        system_prompt: &str,
        history: &[llm::Turn],
        user_input: &str,
        callback: &dyn StreamCallback,
    ) -> Result<llm::ChatResponse, CoreError> {
        let mut last_err = None;
        for cfg in providers {
            match llm::call_provider_streaming(
                cfg,
                temperature,
                max_tokens,
                system_prompt,
                history,
                user_input,
                callback,
            )
            .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("provider {} failed during streaming call: {e}", cfg.provider.name());
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::Connect {
            reason: "no providers configured".to_string(),
        }))
    }

    fn provider_chain(&self) -> Result<Vec<ProviderConfig>, CoreError> {
        let primary_provider = self.config.provider()?;
        let mut chain = vec![ProviderConfig {
            provider: primary_provider,
            api_url: self
                .config
                .llm_api_url
                .clone()
                .unwrap_or_else(|| primary_provider.default_api_url().to_string()),
            api_key: self.config.llm_api_key.clone(),
            model: self
                .config
                .llm_model
                .clone()
                .unwrap_or_else(|| primary_provider.default_model().to_string()),
        }];
        for fallback in &self.config.llm_fallbacks {
            let provider = Provider::from_config_str(&fallback.provider).ok_or_else(|| {
                CoreError::Config {
                    reason: format!("unknown fallback provider '{}'", fallback.provider),
                }
            })?;
            chain.push(ProviderConfig {
                provider,
                api_url: fallback
                    .api_url
                    .clone()
                    .unwrap_or_else(|| provider.default_api_url().to_string()),
                api_key: fallback.api_key.clone(),
                model: fallback
                    .model
                    .clone()
                    .unwrap_or_else(|| provider.default_model().to_string()),
            });
        }
        Ok(chain)
    }

    /// Unescapes the content, then scans for the literal token
    /// `{"tool_call"` (tolerating whitespace after the opening brace),
    /// brace-counts to the matching close, and parses that substring with
    /// the Document Parser.
    fn extract_tool_call(&self, content: &str) -> Result<Option<ToolCallDirective>, CoreError> {
        let region = Region::create(PARSE_REGION_BYTES);
        let cooked = document::unescape(content, &region)?;

        let Some(start) = find_tool_call_start(cooked) else {
            return Ok(None);
        };

        let bytes = cooked.as_bytes();
        let mut depth = 0i32;
        let mut end = None;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(end) = end else {
            return Ok(None);
        };

        let fragment = &cooked[start..end];
        let value = document::parse(fragment, &region)?;
        let call = value.get("tool_call").ok_or_else(|| CoreError::Parse {
            reason: "tool_call fragment missing 'tool_call' key".to_string(),
        })?;
        let name = call
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Parse {
                reason: "tool_call missing required 'name'".to_string(),
            })?;
        let args = call.get("args").and_then(|v| v.as_str()).unwrap_or("");

        Ok(Some(ToolCallDirective {
            name: name.to_string(),
            args: args.to_string(),
        }))
    }

    async fn finalize(&self, text: String) -> Result<String, CoreError> {
        if shield::detect_output_injection(text.as_bytes()) {
            self.event_handler
                .on_event(AuditEvent::ToolExec {
                    tool: "output-shield".to_string(),
                    args: String::new(),
                    status: ToolStatus::Failure,
                })
                .await;
            warn!("output shield flagged the final reply; returning fixed refusal");
            return Ok(OUTPUT_REFUSAL_TEXT.to_string());
        }
        if !self.config.pii_categories.is_empty() {
            return Ok(redact_pii(&text, &self.config.pii_categories));
        }
        Ok(text)
    }
}

fn find_tool_call_start(content: &str) -> Option<usize> {
    let key = "\"tool_call\"";
    let key_pos = content.find(key)?;
    let prefix = &content[..key_pos];
    let brace_pos = prefix.trim_end().rfind('{')?;
    if prefix[brace_pos + 1..].trim().is_empty() {
        Some(brace_pos)
    } else {
        None
    }
}

/// Rewrites text matching simple PII shapes for each configured category.
/// This is a lightweight pass over the `pii_categories` mask; it covers the
/// two shapes most readily expressed without pulling in a dedicated NLP
/// dependency. `AgentConfig::validate` rejects any other category name
/// before it reaches here.
fn redact_pii(text: &str, categories: &[String]) -> String {
    let mut out = text.to_string();
    if categories.iter().any(|c| c == "email") {
        out = redact_pattern(&out, |w| w.contains('@') && w.contains('.'));
    }
    if categories.iter().any(|c| c == "phone") {
        out = redact_pattern(&out, is_phone_like);
    }
    out
}

/// A word is phone-like if it's mostly digits (allowing `+ - ( ) .`
/// separators) and has at least 7 digits — enough to tell a phone number
/// apart from a short numeric token like a year or a quantity.
fn is_phone_like(word: &str) -> bool {
    let digit_count = word.chars().filter(|c| c.is_ascii_digit()).count();
    digit_count >= 7
        && word
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.'))
}

fn redact_pattern(text: &str, matches: impl Fn(&str) -> bool) -> String {
    text.split(' ')
        .map(|word| if matches(word) { "[REDACTED]" } else { word })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::tools::builtin::EchoTool;
    use std::sync::Arc as StdArc;

    fn sample_config() -> AgentConfig {
        serde_json::from_str(
            r#"{
                "llm_provider": "openai",
                "llm_api_key": "sk-test",
                "llm_api_url": null,
                "llm_model": "gpt-4o-mini"
            }"#,
        )
        .unwrap()
    }

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new(8);
        registry
            .register("echo", "returns its argument", StdArc::new(EchoTool))
            .unwrap();
        registry
    }

    #[test]
    fn finds_tool_call_with_no_leading_whitespace() {
        let content = r#"Let me check. {"tool_call":{"name":"echo","args":"hi"}}"#;
        assert!(find_tool_call_start(content).is_some());
    }

    #[test]
    fn finds_tool_call_with_whitespace_after_brace() {
        let content = "{ \"tool_call\":{\"name\":\"echo\",\"args\":\"hi\"}}";
        assert!(find_tool_call_start(content).is_some());
    }

    #[test]
    fn does_not_match_unrelated_brace() {
        let content = r#"{"other": 1} then "tool_call" appears as prose"#;
        assert!(find_tool_call_start(content).is_none());
    }

    #[tokio::test]
    async fn extract_tool_call_reads_name_and_args() {
        let agent = AgentLoop::new(
            sample_config(),
            registry_with_echo(),
            StdArc::new(InMemoryStore::new()),
        );
        let content = r#"Let me check. {"tool_call":{"name":"echo","args":"hi"}}"#;
        let directive = agent.extract_tool_call(content).unwrap().unwrap();
        assert_eq!(directive.name, "echo");
        assert_eq!(directive.args, "hi");
    }

    #[tokio::test]
    async fn extract_tool_call_returns_none_without_a_directive() {
        let agent = AgentLoop::new(
            sample_config(),
            registry_with_echo(),
            StdArc::new(InMemoryStore::new()),
        );
        assert!(agent.extract_tool_call("just a plain answer").unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_flags_script_tags_with_fixed_refusal() {
        let agent = AgentLoop::new(
            sample_config(),
            registry_with_echo(),
            StdArc::new(InMemoryStore::new()),
        );
        let result = agent
            .finalize("hello <script>alert(1)</script>".to_string())
            .await
            .unwrap();
        assert_eq!(result, OUTPUT_REFUSAL_TEXT);
    }

    #[tokio::test]
    async fn finalize_passes_clean_text_through() {
        let agent = AgentLoop::new(
            sample_config(),
            registry_with_echo(),
            StdArc::new(InMemoryStore::new()),
        );
        let result = agent.finalize("The capital is Paris.".to_string()).await.unwrap();
        assert_eq!(result, "The capital is Paris.");
    }

    #[test]
    fn redact_pii_masks_email_addresses() {
        let out = redact_pii(
            "contact me at jane@example.com tomorrow",
            &["email".to_string()],
        );
        assert_eq!(out, "contact me at [REDACTED] tomorrow");
    }

    #[test]
    fn redact_pii_masks_phone_numbers() {
        let out = redact_pii("call me at 555-123-4567 now", &["phone".to_string()]);
        assert_eq!(out, "call me at [REDACTED] now");
    }

    #[test]
    fn redact_pii_leaves_short_numbers_alone() {
        let out = redact_pii("I'll be there in 2024", &["phone".to_string()]);
        assert_eq!(out, "I'll be there in 2024");
    }

    #[test]
    fn redact_pii_applies_every_configured_category() {
        let out = redact_pii(
            "email jane@example.com or call 555-123-4567",
            &["email".to_string(), "phone".to_string()],
        );
        assert_eq!(out, "email [REDACTED] or call [REDACTED]");
    }
}
