//! `[llm]` configuration section

use serde::{Deserialize, Serialize};

/// Environment variable that overrides `llm.api_key`
pub const API_KEY_ENV: &str = "PILOT_API_KEY";

/// LLM endpoint and sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name sent to the endpoint
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of an OpenAI-compatible API (without `/chat/completions`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key; empty means "read from the environment"
    #[serde(default)]
    pub api_key: String,

    /// Maximum completion tokens per request
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Cumulative input-token budget across all requests (None = unlimited)
    #[serde(default)]
    pub max_input_tokens: Option<u64>,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries for transport errors, 429 and 5xx
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    1.0
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            max_input_tokens: None,
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    /// API key from the environment, falling back to the configured value
    pub fn resolved_api_key(&self) -> String {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| self.api_key.clone())
    }

    /// Full chat completions endpoint
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_section() {
        let toml = r#"
model = "claude-sonnet"
base_url = "http://localhost:8080/v1/"
max_input_tokens = 200000
"#;

        let config: LlmConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.model, "claude-sonnet");
        assert_eq!(config.max_input_tokens, Some(200_000));
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.completions_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_defaults() {
        let config = LlmConfig::default();
        assert!(config.max_input_tokens.is_none());
        assert_eq!(config.max_retries, 3);
    }
}
