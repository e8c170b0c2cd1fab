//! Conversation truncation
//!
//! The conversation is cut so that it starts at a plain user turn and no
//! tool result survives without the assistant turn that requested it.
//! Providers reject such orphans.

use std::collections::HashSet;

use llm_core::{ChatMessage, Role};
use tracing::{info, warn};

use crate::config::HistoryConfig;

/// Truncate `messages` in place if it exceeds the configured size
pub fn truncate(messages: &mut Vec<ChatMessage>, config: &HistoryConfig) {
    let original = messages.len();
    if original <= config.max_messages {
        return;
    }

    let preferred = original.saturating_sub(config.preferred_keep);
    let cut = (preferred..original)
        .find(|&start| messages[start].is_user_turn() && is_self_contained(&messages[start..]));

    match cut {
        Some(start) => {
            messages.drain(..start);
            info!(from = original, to = messages.len(), start, "Truncated conversation history");
        }
        None => {
            let start = fallback_start(messages, original.saturating_sub(config.fallback_keep));
            // The kept suffix always opens with the latest user turn
            let anchor = if messages.get(start).is_some_and(ChatMessage::is_user_turn) {
                None
            } else {
                messages[..start].iter().rposition(ChatMessage::is_user_turn)
            };
            let mut kept: Vec<ChatMessage> = anchor.map(|i| messages[i].clone()).into_iter().collect();
            kept.extend(messages.drain(start..));
            *messages = kept;
            warn!(
                from = original,
                to = messages.len(),
                "No clean truncation point found, kept a fixed suffix"
            );
        }
    }
}

/// Move `start` back to the assistant turn that requested a leading tool
/// result, or past the results when no such turn exists
fn fallback_start(messages: &[ChatMessage], start: usize) -> usize {
    let Some(first) = messages.get(start).filter(|m| m.role == Role::Tool) else {
        return start;
    };
    let owner = first.tool_call_id.as_deref().and_then(|id| {
        messages[..start]
            .iter()
            .rposition(|m| m.requested_call_ids().any(|requested| requested == id))
    });
    owner.unwrap_or_else(|| {
        start
            + messages[start..]
                .iter()
                .take_while(|m| m.role == Role::Tool)
                .count()
    })
}

/// Every tool result in `suffix` answers a call requested earlier in `suffix`
fn is_self_contained(suffix: &[ChatMessage]) -> bool {
    let mut requested: HashSet<&str> = HashSet::new();
    for message in suffix {
        requested.extend(message.requested_call_ids());
        if message.role == Role::Tool {
            let answered = message
                .tool_call_id
                .as_deref()
                .is_some_and(|id| requested.contains(id));
            if !answered {
                return false;
            }
        }
    }
    true
}
