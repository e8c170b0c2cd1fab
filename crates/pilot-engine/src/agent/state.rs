//! Agent configuration, execution records and loop state

use chrono::{DateTime, Utc};
use llm_core::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::prompt;
use super::proven::{ProvenStep, ProvenStepTracker};
use crate::config::{AgentSettings, HistoryConfig};
use crate::tools::builtin::{DELEGATE, SUB_TASK_COMPLETE, TERMINATE};

const PREVIEW_CHARS: usize = 200;

/// Which loop produced a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    #[default]
    Main,
    Sub,
}

/// Configuration for one agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub actor: Actor,
    pub system_prompt: String,
    pub next_step_prompt: Option<String>,
    /// Observation length cap
    pub max_observe: usize,
    /// Tools whose invocation ends the loop
    pub special_tools: Vec<String>,
    /// Tools exempt from the observation cap
    pub untruncated_tools: Vec<String>,
    pub history: HistoryConfig,
}

impl AgentConfig {
    /// Main agent: ends on `terminate`
    pub fn main(settings: &AgentSettings, history: HistoryConfig) -> Self {
        Self {
            actor: Actor::Main,
            system_prompt: settings
                .system_prompt
                .clone()
                .unwrap_or_else(|| prompt::SYSTEM_PROMPT.to_string()),
            next_step_prompt: Some(
                settings
                    .next_step_prompt
                    .clone()
                    .unwrap_or_else(|| prompt::NEXT_STEP_PROMPT.to_string()),
            ),
            max_observe: settings.max_observe,
            special_tools: vec![TERMINATE.to_string()],
            untruncated_tools: vec![DELEGATE.to_string()],
            history,
        }
    }

    /// Sub-agent: ends on `sub_task_complete` only
    pub fn sub(settings: &AgentSettings, history: HistoryConfig) -> Self {
        Self {
            actor: Actor::Sub,
            system_prompt: prompt::SUB_AGENT_PROMPT.to_string(),
            next_step_prompt: Some(prompt::SUB_AGENT_NEXT_STEP_PROMPT.to_string()),
            max_observe: settings.max_observe,
            special_tools: vec![SUB_TASK_COMPLETE.to_string()],
            untruncated_tools: Vec::new(),
            history,
        }
    }

    pub fn with_max_observe(mut self, max: usize) -> Self {
        self.max_observe = max;
        self
    }

    pub fn is_special(&self, tool: &str) -> bool {
        self.special_tools.iter().any(|t| t == tool)
    }

    pub fn truncates(&self, tool: &str) -> bool {
        !self.untruncated_tools.iter().any(|t| t == tool)
    }
}

/// One executed tool call within a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: Value,
    pub result_preview: String,
    pub result_full: String,
    pub success: bool,
}

impl ToolCallRecord {
    pub fn new(tool: impl Into<String>, arguments: Value, result: String, success: bool) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            result_preview: result.chars().take(PREVIEW_CHARS).collect(),
            result_full: result,
            success,
        }
    }
}

/// One iteration of a loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    pub actor: Actor,
    pub thinking: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    pub fn success(&self) -> bool {
        self.tool_calls.iter().all(|call| call.success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    /// Step number after which the message was injected
    pub after_step: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Execution history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Step(StepRecord),
    Intervention(InterventionRecord),
}

impl HistoryEntry {
    pub fn step_number(&self) -> Option<u64> {
        match self {
            HistoryEntry::Step(record) => Some(record.step),
            HistoryEntry::Intervention(_) => None,
        }
    }
}

/// Mutable state of a running loop
#[derive(Debug, Default)]
pub struct AgentState {
    pub messages: Vec<ChatMessage>,
    pub current_step: u64,
    pub finished: bool,
    pub history: Vec<HistoryEntry>,
    pub tracker: ProvenStepTracker,
    /// Set once by finalisation
    pub proven_steps: Option<Vec<ProvenStep>>,
    /// Name and output of the special tool that ended the loop
    pub terminal_call: Option<(String, String)>,
    pub last_observation: Option<String>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn mark_finished(&mut self, tool: &str, output: String) {
        self.finished = true;
        self.terminal_call = Some((tool.to_string(), output));
    }

    pub fn increment_step(&mut self) -> u64 {
        self.current_step += 1;
        self.current_step
    }

    /// Step records only, in order
    pub fn steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.history.iter().filter_map(|entry| match entry {
            HistoryEntry::Step(record) => Some(record),
            HistoryEntry::Intervention(_) => None,
        })
    }
}
