use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::StepRecord;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    Paused,
    Terminated,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated | SessionStatus::Completed | SessionStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call announced before it is dispatched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub name: String,
    /// Parsed arguments, or the raw string if they are not JSON
    pub arguments: Value,
}

/// Progress notification pushed to the session's subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated { session_id: String },
    Initializing,
    PeerReady { peer_id: String, live_url: Option<String> },
    SetupCompleted { units: Vec<String> },
    Executing,
    StepStart { step: u64, tools: Vec<PlannedCall> },
    StepComplete { record: StepRecord },
    Paused,
    Resumed,
    Intervention { after_step: u64, message: String },
    Terminated,
    Completed { steps: u64, proven_steps: usize },
    Error { message: String },
    Cleanup,
}

impl SessionEvent {
    /// Final status carried by a terminal event
    pub fn terminal_status(&self) -> Option<SessionStatus> {
        match self {
            SessionEvent::Completed { .. } => Some(SessionStatus::Completed),
            SessionEvent::Terminated => Some(SessionStatus::Terminated),
            SessionEvent::Error { .. } => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// Item on the producer to consumer queue
#[derive(Debug)]
pub(crate) enum QueueItem {
    Event(SessionEvent),
    End,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = SessionEvent::PeerReady {
            peer_id: "p1".into(),
            live_url: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "peer_ready", "peer_id": "p1", "live_url": null})
        );
        assert_eq!(
            serde_json::to_value(SessionEvent::Cleanup).unwrap(),
            json!({"type": "cleanup"})
        );
    }

    #[test]
    fn test_status_names_are_snake_case() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Initializing).unwrap(),
            json!("initializing")
        );
        assert_eq!(SessionStatus::Error.to_string(), "error");
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }
}
