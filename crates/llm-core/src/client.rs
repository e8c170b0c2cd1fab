//! OpenAI-compatible chat client

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::chat::{ChatMessage, ChatRequest, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
use crate::config::LlmConfig;
use crate::tokenizer::count_tokens;

/// Errors surfaced by a chat provider
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("input token budget exceeded: {used} used + {requested} requested > {limit}")]
    TokenLimitExceeded { used: u64, requested: u64, limit: u64 },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Anything that can turn a conversation into a decision
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Model name, used for logging
    fn model(&self) -> &str;

    /// Request one decision
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, LlmError>;
}

/// Input tokens of a request, used for the budget check before it is sent
pub fn estimate_tokens(request: &ChatRequest<'_>) -> u64 {
    let mut tokens = request.system.map_or(0, count_tokens);
    for msg in request.messages {
        tokens += count_tokens(&msg.content);
        for call in msg.tool_calls.iter().flatten() {
            tokens += count_tokens(&call.name) + count_tokens(&call.arguments);
        }
    }
    tokens as u64
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: Role,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: Some(msg.content.clone()),
            tool_calls: msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        call_type: function_type(),
                        function: WireFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

/// HTTP client for `/chat/completions`
#[derive(Debug)]
pub struct HttpChatClient {
    config: LlmConfig,
    api_key: String,
    client: reqwest::Client,
    total_input_tokens: AtomicU64,
}

impl HttpChatClient {
    /// Create a client from the `[llm]` section
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            api_key: config.resolved_api_key(),
            config,
            client,
            total_input_tokens: AtomicU64::new(0),
        })
    }

    /// Input tokens consumed so far
    pub fn total_input_tokens(&self) -> u64 {
        self.total_input_tokens.load(Ordering::Relaxed)
    }

    fn check_budget(&self, requested: u64) -> Result<(), LlmError> {
        if let Some(limit) = self.config.max_input_tokens {
            let used = self.total_input_tokens();
            if used + requested > limit {
                return Err(LlmError::TokenLimitExceeded { used, requested, limit });
            }
        }
        Ok(())
    }

    async fn send_once(&self, body: &WireRequest<'_>) -> Result<WireResponse, LlmError> {
        let mut req = self.client.post(self.config.completions_url()).json(body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 400 && is_context_overflow(&body) {
                return Err(LlmError::TokenLimitExceeded {
                    used: self.total_input_tokens(),
                    requested: 0,
                    limit: self.config.max_input_tokens.unwrap_or(0),
                });
            }
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = resp.json().await?;
        serde_json::from_value(value).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

fn is_context_overflow(body: &str) -> bool {
    body.contains("context_length_exceeded") || body.contains("maximum context length")
}

#[async_trait]
impl ChatProvider for HttpChatClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, request), fields(model = %self.config.model, messages = request.messages.len()))]
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
        let estimated = estimate_tokens(&request);
        self.check_budget(estimated)?;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system {
            messages.push(WireMessage::from(&ChatMessage::system(system)));
        }
        messages.extend(request.messages.iter().map(WireMessage::from));

        let body = WireRequest {
            model: &self.config.model,
            messages,
            tools: request.tools,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let mut attempt = 0;
        let wire = loop {
            match self.send_once(&body).await {
                Ok(wire) => break wire,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying LLM request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let usage = wire.usage;
        let prompt_tokens = usage.map_or(estimated, |u| u.prompt_tokens);
        self.total_input_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);

        let message = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?
            .message;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall::new(call.id, call.function.name, call.function.arguments))
            .collect::<Vec<_>>();

        debug!(
            tool_calls = tool_calls.len(),
            prompt_tokens,
            total_input_tokens = self.total_input_tokens(),
            "LLM decision received"
        );

        Ok(ChatResponse {
            content: message.content.unwrap_or_default(),
            tool_calls,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_with_budget(limit: Option<u64>) -> HttpChatClient {
        HttpChatClient::new(LlmConfig {
            max_input_tokens: limit,
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_budget_rejects_oversized_request() {
        let client = client_with_budget(Some(10));
        client.total_input_tokens.store(8, Ordering::Relaxed);

        let err = client.check_budget(5).unwrap_err();
        assert!(matches!(
            err,
            LlmError::TokenLimitExceeded { used: 8, requested: 5, limit: 10 }
        ));
        assert!(client.check_budget(2).is_ok());
    }

    #[test]
    fn test_no_budget_means_unlimited() {
        let client = client_with_budget(None);
        client.total_input_tokens.store(u64::MAX / 2, Ordering::Relaxed);
        assert!(client.check_budget(1_000_000).is_ok());
    }

    #[test]
    fn test_estimate_tokens_counts_calls() {
        let messages = vec![
            ChatMessage::user("hello world"),
            ChatMessage::assistant_with_tools(
                "",
                vec![ToolCall::new("1", "hello world", "hello world")],
            ),
        ];
        let request = ChatRequest {
            system: Some("hello world"),
            messages: &messages,
            tools: &[],
        };
        assert_eq!(estimate_tokens(&request), 8);
    }

    #[test]
    fn test_wire_response_parses_tool_calls() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "browser", "arguments": "{\"action\":\"get_links\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });

        let wire: WireResponse = serde_json::from_value(raw).unwrap();
        let message = &wire.choices[0].message;
        assert!(message.content.is_none());
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "browser");
        assert_eq!(wire.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn test_context_overflow_detection() {
        assert!(is_context_overflow(r#"{"error":{"code":"context_length_exceeded"}}"#));
        assert!(!is_context_overflow("rate limited"));
    }
}
