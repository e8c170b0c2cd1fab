//! llm-core: Shared LLM plumbing for the pilot engine
//!
//! Provides:
//! - Chat message model (messages, tool calls, tool definitions)
//! - `ChatProvider` trait used by the agent loop
//! - OpenAI-compatible HTTP client with an input-token budget
//! - cl100k token counting for that budget
//! - `[llm]` configuration section

pub mod chat;
pub mod client;
pub mod config;
pub mod tokenizer;

pub use chat::{
    ChatMessage, ChatRequest, ChatResponse, FunctionDefinition, Role, ToolCall, ToolDefinition,
    Usage,
};
pub use client::{ChatProvider, HttpChatClient, LlmError};
pub use config::LlmConfig;
