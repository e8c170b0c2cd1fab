//! Think/act loop
//!
//! Each [`AgentLoop::step`] asks the model for one decision and dispatches
//! every requested call. The step budget is not enforced here; callers stop
//! invoking `step` when it runs out.

use std::sync::Arc;

use chrono::Utc;
use llm_core::{ChatMessage, ChatProvider, ChatRequest, ToolCall, ToolDefinition};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::history;
use super::observer::StepObserver;
use super::plan::SharedPlan;
use super::proven::{ProvenStep, ProvenStepTracker};
use super::state::{
    Actor, AgentConfig, AgentState, HistoryEntry, InterventionRecord, StepRecord, ToolCallRecord,
};
use crate::delegate::DelegationReport;
use crate::error::SessionError;
use crate::tools::dispatcher::Dispatcher;
use crate::tools::ToolContext;

/// What one step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The model answered without calling tools
    Thought,
    /// Tools ran; `success` is false if any call failed
    Acted { success: bool },
    /// A special tool ended the loop
    Finished,
}

/// The agent loop orchestrator
pub struct AgentLoop {
    provider: Arc<dyn ChatProvider>,
    dispatcher: Dispatcher,
    config: AgentConfig,
    tools: Vec<ToolDefinition>,
    plan: Option<SharedPlan>,
    session_id: String,
    state: AgentState,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn ChatProvider>, dispatcher: Dispatcher, config: AgentConfig) -> Self {
        let tools = dispatcher.registry().tool_definitions();
        Self {
            provider,
            dispatcher,
            config,
            tools,
            plan: None,
            session_id: String::new(),
            state: AgentState::new(),
        }
    }

    pub fn with_plan(mut self, plan: SharedPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Continue an existing step sequence instead of starting at zero
    pub fn starting_at_step(mut self, step: u64) -> Self {
        self.state.current_step = step;
        self
    }

    /// Record replayable calls into this plan step from the start
    pub fn tracking_plan_step(mut self, index: Option<usize>) -> Self {
        self.state.tracker = ProvenStepTracker::seeded(index);
        self
    }

    pub fn add_message(&mut self, message: ChatMessage) {
        self.state.add_message(message);
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn current_step(&self) -> u64 {
        self.state.current_step
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Inject a user instruction before the next decision; consumes no step number
    pub fn inject_intervention(&mut self, instruction: &str, message: &str) -> InterventionRecord {
        self.state.add_message(ChatMessage::user(instruction));
        let record = InterventionRecord {
            after_step: self.state.current_step,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        self.state
            .history
            .push(HistoryEntry::Intervention(record.clone()));
        info!(session_id = %self.session_id, after_step = record.after_step, "Intervention injected");
        record
    }

    /// Completed proven steps, computed once; sub-agents never finalise
    pub fn finalize_proven_steps(&mut self) -> Vec<ProvenStep> {
        if self.config.actor == Actor::Sub {
            return Vec::new();
        }
        if self.state.proven_steps.is_none() {
            let steps = self.state.tracker.finalize();
            info!(session_id = %self.session_id, count = steps.len(), "Proven steps finalised");
            self.state.proven_steps = Some(steps);
        }
        self.state.proven_steps.clone().unwrap_or_default()
    }

    /// Run steps until finished or `budget` steps have been taken
    pub async fn run(&mut self, budget: u64, observer: &dyn StepObserver) -> Result<(), SessionError> {
        let start = self.state.current_step;
        while !self.state.finished && self.state.current_step - start < budget {
            self.step(observer).await?;
        }
        Ok(())
    }

    fn in_progress_step(&self) -> Option<usize> {
        match &self.plan {
            Some(plan) => plan.lock().in_progress(),
            None => self.state.tracker.current(),
        }
    }

    fn track(&mut self, tool: &str, args: &Value) {
        match &self.plan {
            Some(plan) => {
                let plan = plan.lock();
                self.state.tracker.observe(tool, args, Some(&plan));
            }
            None => self.state.tracker.observe(tool, args, None),
        }
    }

    /// One think/act iteration
    #[instrument(skip(self, observer), fields(session_id = %self.session_id, actor = ?self.config.actor))]
    pub async fn step(&mut self, observer: &dyn StepObserver) -> Result<StepOutcome, SessionError> {
        history::truncate(&mut self.state.messages, &self.config.history);
        if let Some(prompt) = &self.config.next_step_prompt {
            self.state.messages.push(ChatMessage::user(prompt.clone()));
        }
        let step = self.state.increment_step();
        debug!(step, messages = self.state.messages.len(), "Requesting decision");

        let request = ChatRequest {
            system: Some(&self.config.system_prompt),
            messages: &self.state.messages,
            tools: &self.tools,
        };
        let response = self.provider.chat(request).await.map_err(|e| {
            warn!(step, error = %e, "LLM request failed");
            SessionError::from(e)
        })?;

        if response.tool_calls.is_empty() {
            debug!(step, "Decision carried no tool calls");
            if !response.content.is_empty() {
                self.state
                    .add_message(ChatMessage::assistant(response.content.clone()));
            }
            let record = StepRecord {
                step,
                actor: self.config.actor,
                thinking: response.content,
                tool_calls: Vec::new(),
                timestamp: Utc::now(),
            };
            observer.step_completed(&record).await;
            self.state.history.push(HistoryEntry::Step(record));
            return Ok(StepOutcome::Thought);
        }

        let calls = response.tool_calls;
        info!(
            step,
            tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Acting"
        );
        self.state.add_message(ChatMessage::assistant_with_tools(
            response.content.clone(),
            calls.clone(),
        ));
        observer.step_started(step, &calls).await;

        let mut records = Vec::with_capacity(calls.len());
        let mut delegated = Vec::new();
        let mut terminal = None;

        for call in &calls {
            let (record, report) = self.act(call).await;
            if let Some(report) = report {
                self.absorb(report, &mut delegated);
            }
            if self.config.is_special(&call.name) {
                terminal = Some((call.name.clone(), record.result_full.clone()));
            }
            records.push(record);
        }

        let success = records.iter().all(|r| r.success);
        let record = StepRecord {
            step,
            actor: self.config.actor,
            thinking: response.content,
            tool_calls: records,
            timestamp: Utc::now(),
        };
        observer.step_completed(&record).await;
        self.state.history.push(HistoryEntry::Step(record));
        for entry in delegated {
            if let HistoryEntry::Step(record) = &entry {
                observer.step_completed(record).await;
            }
            self.state.history.push(entry);
        }

        match terminal {
            Some((tool, output)) => {
                self.finish(&tool, output);
                Ok(StepOutcome::Finished)
            }
            None => Ok(StepOutcome::Acted { success }),
        }
    }

    /// Dispatch one call and feed its result back into the conversation
    async fn act(&mut self, call: &ToolCall) -> (ToolCallRecord, Option<DelegationReport>) {
        let ctx = ToolContext::new(self.session_id.clone())
            .with_actor(self.config.actor)
            .with_step(self.state.current_step)
            .with_in_progress_step(self.in_progress_step());

        let outcome = self
            .dispatcher
            .dispatch(&call.name, &call.arguments, &ctx)
            .await;
        let success = outcome.is_success();
        let mut observation = outcome.observation(&call.name);
        if self.config.truncates(&call.name) && observation.chars().count() > self.config.max_observe {
            observation = observation.chars().take(self.config.max_observe).collect();
        }
        self.state
            .add_message(ChatMessage::tool_result(call.id.clone(), observation.clone()));

        let args = parse_recorded_args(&call.arguments);
        if success {
            self.track(&call.name, &args);
        }
        let report = outcome.into_result().and_then(|result| result.delegation);

        self.state.last_observation = Some(observation.clone());
        (ToolCallRecord::new(&call.name, args, observation, success), report)
    }

    /// Merge a delegate's bookkeeping into this loop
    fn absorb(&mut self, report: DelegationReport, delegated: &mut Vec<HistoryEntry>) {
        let before = self.state.current_step;
        self.state.current_step = if report.steps_used() > 0 {
            report.final_step
        } else {
            before + 1
        };
        debug!(
            from = before,
            to = self.state.current_step,
            completed = report.completed,
            "Absorbed delegate steps"
        );
        if let Some(index) = report.plan_step {
            self.state.tracker.merge(index, report.proven_calls);
        }
        delegated.extend(report.history);
    }

    fn finish(&mut self, tool: &str, output: String) {
        if let Some(plan) = &self.plan {
            if let Some(index) = plan.lock().block_in_progress() {
                info!(step_index = index, "Blocked unfinished plan step");
            }
        }
        self.finalize_proven_steps();
        info!(
            session_id = %self.session_id,
            tool,
            step = self.state.current_step,
            "Agent finished"
        );
        self.state.mark_finished(tool, output);
    }
}

fn parse_recorded_args(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::observer::NoopObserver;
    use crate::agent::plan::StepStatus;
    use crate::config::{AgentSettings, ChannelConfig, HistoryConfig};
    use crate::rpc::RpcChannel;
    use crate::testing::{call, decide, MemoryPeer, PeerReply, ScriptedProvider};
    use crate::tools::builtin::{BrowserTool, PlanningTool, TerminateTool};
    use crate::tools::registry::ToolRegistry;
    use llm_core::{ChatResponse, LlmError, Role};
    use parking_lot::Mutex;
    use serde_json::json;

    fn main_loop(provider: Arc<ScriptedProvider>, peer: Arc<MemoryPeer>) -> (AgentLoop, SharedPlan) {
        let plan = SharedPlan::default();
        let channel = Arc::new(RpcChannel::new(peer, ChannelConfig::default()));
        let mut registry = ToolRegistry::new();
        registry.register(BrowserTool::new(channel));
        registry.register(PlanningTool::new(plan.clone()));
        registry.register(TerminateTool);
        let config = AgentConfig::main(&AgentSettings::default(), HistoryConfig::default());
        let agent = AgentLoop::new(provider, Dispatcher::new(registry), config)
            .with_plan(plan.clone())
            .with_session_id("test");
        (agent, plan)
    }

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<u64>>,
        completed: Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl StepObserver for Recorder {
        async fn step_started(&self, step: u64, _calls: &[ToolCall]) {
            self.started.lock().push(step);
        }

        async fn step_completed(&self, record: &StepRecord) {
            self.completed.lock().push(record.step);
        }
    }

    #[tokio::test]
    async fn test_thought_step_records_text_without_acting() {
        let provider = ScriptedProvider::new(vec![ChatResponse::text("Let me think")]);
        let peer = MemoryPeer::echo();
        let (mut agent, _) = main_loop(provider.clone(), peer.clone());
        let recorder = Recorder::default();

        let outcome = agent.step(&recorder).await.unwrap();
        assert_eq!(outcome, StepOutcome::Thought);
        assert_eq!(agent.current_step(), 1);
        assert_eq!(peer.command_count(), 0);
        assert!(recorder.started.lock().is_empty());
        assert_eq!(*recorder.completed.lock(), vec![1]);

        let record = agent.state().steps().next().unwrap();
        assert_eq!(record.thinking, "Let me think");
        assert!(record.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_request_carries_prompts_and_tools() {
        let provider = ScriptedProvider::new(vec![ChatResponse::text("ok")]);
        let (mut agent, _) = main_loop(provider.clone(), MemoryPeer::echo());
        agent.add_message(ChatMessage::user("Log in to the demo shop"));

        agent.step(&NoopObserver).await.unwrap();

        let seen = &provider.requests()[0];
        assert_eq!(seen.messages[0].content, "Log in to the demo shop");
        let last = seen.messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, crate::agent::prompt::NEXT_STEP_PROMPT);
        assert_eq!(seen.tools, vec!["browser", "planning", "terminate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logical_failure_keeps_loop_running() {
        let provider = ScriptedProvider::new(vec![decide(
            "browser",
            json!({"action": "click", "by_text": "Missing"}),
        )]);
        let peer = MemoryPeer::new(|_| PeerReply::Json(json!({"success": false, "error": "element not found"})));
        let (mut agent, _) = main_loop(provider, peer);

        let outcome = agent.step(&NoopObserver).await.unwrap();
        assert_eq!(outcome, StepOutcome::Acted { success: false });
        assert!(!agent.is_finished());

        let record = agent.state().steps().next().unwrap();
        assert!(!record.success());
        let tool_message = agent.state().messages.last().unwrap();
        assert_eq!(tool_message.role, Role::Tool);
        assert!(tool_message.content.contains("element not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observation_is_truncated() {
        let provider = ScriptedProvider::new(vec![decide("browser", json!({"action": "get_links"}))]);
        let peer = MemoryPeer::new(|_| PeerReply::Json(json!({"success": true, "message": "x".repeat(500)})));
        let (agent, _) = main_loop(provider, peer);
        let mut agent = AgentLoop {
            config: agent.config.clone().with_max_observe(50),
            ..agent
        };

        agent.step(&NoopObserver).await.unwrap();
        assert_eq!(agent.state().messages.last().unwrap().content.chars().count(), 50);
    }

    #[tokio::test]
    async fn test_token_budget_is_fatal() {
        let provider = ScriptedProvider::new(vec![]);
        provider.push_err(LlmError::TokenLimitExceeded {
            used: 100,
            requested: 50,
            limit: 120,
        });
        let (mut agent, _) = main_loop(provider, MemoryPeer::echo());

        let err = agent.step(&NoopObserver).await.unwrap_err();
        assert!(matches!(err, SessionError::TokenBudgetExceeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_blocks_open_step_and_finalises() {
        let provider = ScriptedProvider::new(vec![
            decide("planning", json!({"command": "create", "title": "Login", "steps": ["Open", "Sign in"]})),
            ChatResponse::with_calls(
                "",
                vec![
                    call("planning", json!({"command": "mark_step", "step_index": 0, "step_status": "in_progress"})),
                    call("browser", json!({"action": "navigate_to", "url": "https://shop.test"})),
                ],
            ),
            ChatResponse::with_calls(
                "",
                vec![
                    call("planning", json!({"command": "mark_step", "step_index": 0, "step_status": "completed"})),
                    call("planning", json!({"command": "mark_step", "step_index": 1, "step_status": "in_progress"})),
                ],
            ),
            decide("terminate", json!({"status": "failure"})),
        ]);
        let (mut agent, plan) = main_loop(provider, MemoryPeer::echo());

        let recorder = Recorder::default();
        let mut outcomes = Vec::new();
        while !agent.is_finished() {
            outcomes.push(agent.step(&recorder).await.unwrap());
        }

        assert_eq!(outcomes.last(), Some(&StepOutcome::Finished));
        assert_eq!(agent.current_step(), 4);
        assert_eq!(*recorder.completed.lock(), vec![1, 2, 3, 4]);
        assert_eq!(plan.lock().steps[1].status, StepStatus::Blocked);

        let (tool, output) = agent.state().terminal_call.clone().unwrap();
        assert_eq!(tool, "terminate");
        assert!(output.contains("status: failure"));

        let proven = agent.finalize_proven_steps();
        assert_eq!(proven.len(), 1);
        assert_eq!(proven[0].description, "Open");
        assert_eq!(proven[0].tool_calls[0].arguments["url"], "https://shop.test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_step_without_status_proves_step() {
        let provider = ScriptedProvider::new(vec![
            decide("planning", json!({"command": "create", "steps": ["Open", "Sign in"]})),
            decide("planning", json!({"command": "mark_step", "step_index": 0, "step_status": "in_progress"})),
            decide("browser", json!({"action": "navigate_to", "url": "https://shop.test"})),
            decide("planning", json!({"command": "mark_step", "step_index": 0})),
            decide("terminate", json!({"status": "success"})),
        ]);
        let (mut agent, plan) = main_loop(provider, MemoryPeer::echo());
        while !agent.is_finished() {
            agent.step(&NoopObserver).await.unwrap();
        }

        assert_eq!(plan.lock().steps[0].status, StepStatus::Completed);
        let proven = agent.finalize_proven_steps();
        assert_eq!(proven.len(), 1);
        assert_eq!(proven[0].index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_step_records_nothing_further() {
        let provider = ScriptedProvider::new(vec![
            decide("planning", json!({"command": "create", "steps": ["Open", "Sign in"]})),
            decide("planning", json!({"command": "mark_step", "step_index": 0, "step_status": "in_progress"})),
            decide("planning", json!({"command": "mark_step", "step_index": 0, "step_status": "blocked"})),
            decide("browser", json!({"action": "click", "by_text": "Go"})),
        ]);
        let (mut agent, _) = main_loop(provider, MemoryPeer::echo());
        for _ in 0..4 {
            agent.step(&NoopObserver).await.unwrap();
        }

        assert_eq!(agent.state().tracker.current(), None);
        assert!(agent.state().tracker.open_calls(0).is_empty());
    }

    #[tokio::test]
    async fn test_intervention_does_not_consume_step() {
        let provider = ScriptedProvider::new(vec![ChatResponse::text("ok")]);
        let (mut agent, _) = main_loop(provider.clone(), MemoryPeer::echo());
        agent.step(&NoopObserver).await.unwrap();

        let record = agent.inject_intervention("URGENT: stop", "stop");
        assert_eq!(record.after_step, 1);
        assert_eq!(agent.current_step(), 1);

        agent.step(&NoopObserver).await.unwrap();
        let seen = provider.requests();
        assert!(seen[1].messages.iter().any(|m| m.content == "URGENT: stop"));
        let steps: Vec<u64> = agent.state().steps().map(|r| r.step).collect();
        assert_eq!(steps, vec![1, 2]);
    }
}
