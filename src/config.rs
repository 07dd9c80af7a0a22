//! Agent configuration: the full config surface, deserialized.
//!
//! Deserialized via `serde`/`serde_json` from a single JSON document — no
//! TOML/YAML parsing dependency is introduced; `serde_json` is already in
//! the stack for the document parser's wire-format cousin, so it's reused
//! here rather than adding `toml`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::llm::Provider;

/// `think_level` pins `(temperature, max_tokens)` to a documented pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkLevel {
    Off,
    Low,
    Medium,
    High,
}

impl ThinkLevel {
    /// `(temperature, max_tokens)` pinned by this level.
    pub fn pinned(self) -> (f64, u32) {
        match self {
            ThinkLevel::Off => (0.3, 512),
            ThinkLevel::Low => (0.5, 1024),
            ThinkLevel::Medium => (0.7, 2048),
            ThinkLevel::High => (0.9, 4096),
        }
    }
}

/// One entry of `llm_fallbacks[≤4]`: a full alternate provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub provider: String,
    pub api_url: Option<String>,
    pub api_key: String,
    pub model: Option<String>,
}

/// Maximum length of `llm_fallbacks`.
pub const MAX_FALLBACKS: usize = 4;

/// The full config surface the config-file loader recognizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_arena_size_mb")]
    pub arena_size_mb: usize,

    pub llm_provider: String,
    pub llm_api_key: String,
    pub llm_api_url: Option<String>,
    pub llm_model: Option<String>,
    #[serde(default)]
    pub llm_fallbacks: Vec<FallbackConfig>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    pub think_level: Option<ThinkLevel>,
    #[serde(default)]
    pub pii_categories: Vec<String>,

    #[serde(default)]
    pub daily_token_budget: u64,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Bearer token internal clients must present to `POST
    /// /v1/chat/completions`.
    #[serde(default)]
    pub proxy_token: String,
    /// Identifies the caller for the proxy's per-caller daily budget sum.
    #[serde(default = "default_proxy_caller")]
    pub proxy_caller: String,

    /// `"captain"`, `"crew"`, or absent to run neither mesh role.
    pub mesh_role: Option<String>,
    #[serde(default = "default_mesh_port")]
    pub mesh_port: u16,
    #[serde(default)]
    pub mesh_secret: String,
    #[serde(default = "default_mesh_heartbeat_interval_ms")]
    pub mesh_heartbeat_interval_ms: u64,
    /// Crew-only: the Captain's base URL to register and heartbeat against.
    pub mesh_captain_url: Option<String>,
    /// Crew-only: the capability names this node advertises.
    #[serde(default)]
    pub mesh_capabilities: Vec<String>,
    /// Crew-only: this node's own reachable base URL, given to the Captain
    /// at registration time.
    pub mesh_self_endpoint: Option<String>,
}

fn default_db_path() -> String {
    "coreagent.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_arena_size_mb() -> usize {
    16
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tool_rounds() -> u32 {
    4
}

fn default_proxy_port() -> u16 {
    7432
}

fn default_proxy_caller() -> String {
    "agent-zero".to_string()
}

fn default_mesh_port() -> u16 {
    7433
}

fn default_mesh_heartbeat_interval_ms() -> u64 {
    15_000
}

impl AgentConfig {
    /// Loads and parses the config document at `path`. Missing required
    /// fields or malformed JSON surface as [`CoreError::Config`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| CoreError::Config {
            reason: format!("reading {}: {e}", path.display()),
        })?;
        serde_json::from_str(&text).map_err(|e| CoreError::Config {
            reason: format!("parsing {}: {e}", path.display()),
        })
    }

    /// Resolves `llm_provider` into the runtime [`Provider`] enum.
    pub fn provider(&self) -> Result<Provider, CoreError> {
        Provider::from_config_str(&self.llm_provider).ok_or_else(|| CoreError::Config {
            reason: format!("unknown llm_provider '{}'", self.llm_provider),
        })
    }

    /// `(temperature, max_tokens)`: `think_level`, when set, overrides the
    /// explicit fields.
    pub fn effective_generation_params(&self) -> (f64, u32) {
        match self.think_level {
            Some(level) => level.pinned(),
            None => (self.temperature, self.max_tokens),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.llm_api_key.is_empty() {
            return Err(CoreError::Config {
                reason: "llm_api_key must not be empty".to_string(),
            });
        }
        if self.llm_fallbacks.len() > MAX_FALLBACKS {
            return Err(CoreError::Config {
                reason: format!(
                    "llm_fallbacks has {} entries, maximum is {MAX_FALLBACKS}",
                    self.llm_fallbacks.len()
                ),
            });
        }
        if let Some(category) = self
            .pii_categories
            .iter()
            .find(|c| !SUPPORTED_PII_CATEGORIES.contains(&c.as_str()))
        {
            return Err(CoreError::Config {
                reason: format!("unsupported pii_categories entry '{category}'"),
            });
        }
        self.provider()?;
        Ok(())
    }
}

/// The only `pii_categories` entries the redaction pass knows how to act
/// on; anything else is rejected at config-validation time rather than
/// silently ignored.
const SUPPORTED_PII_CATEGORIES: &[&str] = &["email", "phone"];

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_json() -> &'static str {
        r#"{
            "db_path": "test.db",
            "log_level": "debug",
            "arena_size_mb": 8,
            "llm_provider": "openai",
            "llm_api_key": "sk-test",
            "llm_api_url": null,
            "llm_model": "gpt-4o-mini",
            "llm_fallbacks": []
        }"#
    }

    #[test]
    fn loads_from_file_with_defaults_filled_in() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_json().as_bytes()).unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.db_path, "test.db");
        assert_eq!(config.max_tool_rounds, 4);
        assert_eq!(config.proxy_port, 7432);
    }

    #[test]
    fn rejects_unknown_provider() {
        let config: AgentConfig = serde_json::from_str(
            &sample_json().replace("\"openai\"", "\"not-a-provider\""),
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_many_fallbacks() {
        let mut config: AgentConfig = serde_json::from_str(sample_json()).unwrap();
        for _ in 0..(MAX_FALLBACKS + 1) {
            config.llm_fallbacks.push(FallbackConfig {
                provider: "openai".to_string(),
                api_url: None,
                api_key: "k".to_string(),
                model: None,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn think_level_overrides_explicit_params() {
        let mut config: AgentConfig = serde_json::from_str(sample_json()).unwrap();
        config.think_level = Some(ThinkLevel::High);
        assert_eq!(config.effective_generation_params(), (0.9, 4096));
    }

    #[test]
    fn accepts_supported_pii_categories() {
        let mut config: AgentConfig = serde_json::from_str(sample_json()).unwrap();
        config.pii_categories = vec!["email".to_string(), "phone".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_pii_category() {
        let mut config: AgentConfig = serde_json::from_str(sample_json()).unwrap();
        config.pii_categories = vec!["ssn".to_string()];
        assert!(config.validate().is_err());
    }
}
