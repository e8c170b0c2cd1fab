//! Error taxonomy
//!
//! Only [`SessionError`] is fatal to a session. Channel and tool failures are
//! turned into observations before they reach the loop; resolution failures
//! abort the chain being resolved and nothing else.

use std::time::Duration;

use llm_core::LlmError;
use thiserror::Error;

/// Failure of the RPC channel itself, as opposed to a peer-reported failure
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Timeout waiting for peer response (waited {}s)\n--- peer log ---\n{log_tail}", .waited.as_secs())]
    Timeout { waited: Duration, log_tail: String },

    #[error("Invalid peer response: {reason} | raw content: {raw}\n--- peer log ---\n{log_tail}")]
    Malformed {
        reason: String,
        raw: String,
        log_tail: String,
    },

    #[error("Peer file-system error: {0}")]
    Peer(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Failure to expand a unit's dependency chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Dependency not found: {0}")]
    NotFound(String),

    #[error("Failed to load unit {id}: {reason}")]
    Store { id: String, reason: String },
}

/// Fatal session failures
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Token budget exceeded: {0}")]
    TokenBudgetExceeded(String),

    #[error("Peer provisioning failed: {0}")]
    PeerProvisioning(String),

    #[error("LLM request failed: {0}")]
    Llm(String),
}

impl From<LlmError> for SessionError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::TokenLimitExceeded { .. } => SessionError::TokenBudgetExceeded(err.to_string()),
            other => SessionError::Llm(other.to_string()),
        }
    }
}

/// Control-plane operation rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is not running")]
    NotRunning(String),
}
