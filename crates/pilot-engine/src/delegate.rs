//! Sub-agent delegation
//!
//! The `delegate` tool runs a nested [`AgentLoop`] with its own conversation
//! against the parent's browser tool instance. Its step counter continues the
//! parent's sequence, and what it did comes back as a [`DelegationReport`]
//! for the parent loop to absorb.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use llm_core::{ChatMessage, ChatProvider};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::agent::{prompt, AgentConfig, AgentLoop, HistoryEntry, NoopObserver, ProvenCall};
use crate::config::{AgentSettings, HistoryConfig};
use crate::tools::builtin::{SubTaskCompleteTool, DELEGATE, SUB_TASK_COMPLETE};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::registry::ToolRegistry;
use crate::tools::{ParameterProperty, ParameterSchema, Tool, ToolContext, ToolResult};

const SUMMARY_CHARS: usize = 200;
const FAILURE_CHARS: usize = 500;

/// Bookkeeping a sub-agent hands back to its parent
#[derive(Debug, Clone)]
pub struct DelegationReport {
    /// Parent counter value the sub-agent started from
    pub seed_step: u64,
    /// Sub-agent counter value when it stopped
    pub final_step: u64,
    pub history: Vec<HistoryEntry>,
    /// Parent plan step that was in progress
    pub plan_step: Option<usize>,
    /// Replayable calls recorded for `plan_step`
    pub proven_calls: Vec<ProvenCall>,
    pub completed: bool,
    pub summary: Option<String>,
}

impl DelegationReport {
    pub fn steps_used(&self) -> u64 {
        self.final_step.saturating_sub(self.seed_step)
    }
}

/// Hands a sub-task to an isolated nested agent
pub struct DelegateTool {
    provider: Arc<dyn ChatProvider>,
    browser: Arc<dyn Tool>,
    settings: AgentSettings,
    history: HistoryConfig,
}

impl DelegateTool {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        browser: Arc<dyn Tool>,
        settings: AgentSettings,
        history: HistoryConfig,
    ) -> Self {
        Self {
            provider,
            browser,
            settings,
            history,
        }
    }

    fn sub_agent(&self, ctx: &ToolContext) -> AgentLoop {
        let mut registry = ToolRegistry::new();
        registry.register_shared(self.browser.clone());
        registry.register(SubTaskCompleteTool);

        AgentLoop::new(
            self.provider.clone(),
            Dispatcher::new(registry),
            AgentConfig::sub(&self.settings, self.history),
        )
        .with_session_id(ctx.session_id.clone())
        .starting_at_step(ctx.step)
        .tracking_plan_step(ctx.in_progress_step)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Summary argument of the last `sub_task_complete` call
fn completion_summary(agent: &AgentLoop) -> Option<String> {
    agent
        .state()
        .steps()
        .flat_map(|record| record.tool_calls.iter())
        .filter(|call| call.tool == SUB_TASK_COMPLETE)
        .last()
        .and_then(|call| call.arguments["summary"].as_str().map(str::to_string))
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        DELEGATE
    }

    fn description(&self) -> &str {
        "Delegate a self-contained sub-task (login, form filling, menu navigation) to a sub-agent \
         that shares the browser but has its own conversation. Only its summary comes back."
    }

    fn parameters_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with_required(
                "task",
                ParameterProperty::string("The sub-task, e.g. 'Log in as user@example.com with password abc123'"),
            )
            .with_property(
                "context",
                ParameterProperty::string("What has been done so far and where the browser currently is"),
            )
            .with_property(
                "max_steps",
                ParameterProperty::integer("Step budget for the sub-agent (default 100)"),
            )
    }

    #[instrument(skip(self, args, ctx), fields(session_id = %ctx.session_id, seed_step = ctx.step))]
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolResult> {
        let task = args["task"].as_str().unwrap_or_default();
        let context = args["context"].as_str();
        let budget = args["max_steps"]
            .as_u64()
            .unwrap_or(self.settings.delegate_max_steps);

        let mut sub = self.sub_agent(ctx);
        sub.add_message(ChatMessage::user(prompt::sub_task(task, context)));
        info!(budget, plan_step = ?ctx.in_progress_step, "Delegating sub-task");

        let started = Instant::now();
        let run = sub.run(budget, &NoopObserver).await;
        let elapsed = started.elapsed().as_secs_f64();

        let report = DelegationReport {
            seed_step: ctx.step,
            final_step: sub.current_step(),
            history: sub.state().history.clone(),
            plan_step: ctx.in_progress_step,
            proven_calls: ctx
                .in_progress_step
                .map(|index| sub.state().tracker.open_calls(index).to_vec())
                .unwrap_or_default(),
            completed: sub.is_finished(),
            summary: completion_summary(&sub),
        };
        let steps_used = report.steps_used();

        let result = match run {
            Err(e) => {
                warn!(steps_used, error = %e, "Sub-agent failed");
                ToolResult::error(format!("Sub-agent execution error: {}", e))
            }
            Ok(()) if report.completed => {
                info!(steps_used, elapsed_secs = elapsed, "Sub-agent completed");
                let summary = report.summary.as_deref().unwrap_or("Task completed");
                ToolResult::success(format!(
                    "Sub-agent completed ({} steps, {:.1}s)\n{}",
                    steps_used,
                    elapsed,
                    truncate_chars(summary, SUMMARY_CHARS)
                ))
            }
            Ok(()) => {
                warn!(steps_used, "Sub-agent exhausted its budget");
                let last = sub.state().last_observation.as_deref().unwrap_or("none");
                ToolResult::error(format!(
                    "Sub-agent used {} steps without completing task\nFinal state: running\nLast result: {}",
                    steps_used,
                    truncate_chars(last, FAILURE_CHARS)
                ))
            }
        };
        Ok(result.with_delegation(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{SharedPlan, StepOutcome};
    use crate::config::ChannelConfig;
    use crate::rpc::RpcChannel;
    use crate::testing::{call, decide, MemoryPeer, ScriptedProvider};
    use crate::tools::builtin::{BrowserTool, PlanningTool, TerminateTool};
    use llm_core::{ChatResponse, LlmError, Role};
    use serde_json::json;

    fn parent(provider: Arc<ScriptedProvider>, peer: Arc<MemoryPeer>) -> (AgentLoop, SharedPlan) {
        let plan = SharedPlan::default();
        let channel = Arc::new(RpcChannel::new(peer, ChannelConfig::default()));
        let browser: Arc<dyn Tool> = Arc::new(BrowserTool::new(channel));
        let settings = AgentSettings::default();

        let mut registry = ToolRegistry::new();
        registry.register_shared(browser.clone());
        registry.register(PlanningTool::new(plan.clone()));
        registry.register(TerminateTool);
        registry.register(DelegateTool::new(
            provider.clone(),
            browser,
            settings.clone(),
            HistoryConfig::default(),
        ));

        let agent = AgentLoop::new(
            provider,
            Dispatcher::new(registry),
            AgentConfig::main(&settings, HistoryConfig::default()),
        )
        .with_plan(plan.clone())
        .with_session_id("parent");
        (agent, plan)
    }

    fn step_numbers(agent: &AgentLoop) -> Vec<u64> {
        agent.state().steps().map(|r| r.step).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_is_failure_and_advances_counter() {
        let mut script = vec![decide("delegate", json!({"task": "find the coupon", "max_steps": 5}))];
        script.extend((0..5).map(|_| decide("browser", json!({"action": "get_links"}))));
        let provider = ScriptedProvider::new(script);
        let (mut agent, _) = parent(provider.clone(), MemoryPeer::echo());

        let outcome = agent.step(&NoopObserver).await.unwrap();

        assert_eq!(outcome, StepOutcome::Acted { success: false });
        assert_eq!(agent.current_step(), 6);
        assert_eq!(step_numbers(&agent), vec![1, 2, 3, 4, 5, 6]);
        assert!(!agent.is_finished());

        let observation = &agent.state().messages.last().unwrap().content;
        assert!(observation.contains("Sub-agent used 5 steps without completing task"));
        assert!(observation.contains("Last result: Observed output of cmd `browser`"));

        // The sub-agent only sees its own tool set
        let sub_request = &provider.requests()[1];
        assert_eq!(sub_request.tools, vec!["browser", "sub_task_complete"]);
        assert_eq!(sub_request.messages[0].content, "Sub-task: find the coupon");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_merges_proven_calls() {
        let provider = ScriptedProvider::new(vec![
            decide("planning", json!({"command": "create", "steps": ["Log in"]})),
            ChatResponse::with_calls(
                "",
                vec![
                    call("planning", json!({"command": "mark_step", "step_index": 0, "step_status": "in_progress"})),
                    call("delegate", json!({"task": "log in", "context": "on the home page"})),
                ],
            ),
            decide("browser", json!({"action": "fill", "by_label": "Email", "text": "a@b.c"})),
            decide("sub_task_complete", json!({"summary": "Logged in as a@b.c"})),
            decide("planning", json!({"command": "mark_step", "step_index": 0, "step_status": "completed"})),
            decide("terminate", json!({"status": "success"})),
        ]);
        let (mut agent, _) = parent(provider, MemoryPeer::echo());

        while !agent.is_finished() {
            agent.step(&NoopObserver).await.unwrap();
        }

        assert_eq!(step_numbers(&agent), vec![1, 2, 3, 4, 5, 6]);
        let delegate_result = agent
            .state()
            .messages
            .iter()
            .find(|m| m.role == Role::Tool && m.content.contains("Sub-agent completed"))
            .unwrap();
        assert!(delegate_result.content.contains("(2 steps,"));
        assert!(delegate_result.content.ends_with("Logged in as a@b.c"));

        let proven = agent.finalize_proven_steps();
        assert_eq!(proven.len(), 1);
        assert_eq!(proven[0].description, "Log in");
        assert_eq!(proven[0].tool_calls[0].arguments["action"], "fill");
    }

    #[tokio::test]
    async fn test_zero_step_budget_advances_parent_by_one() {
        let provider = ScriptedProvider::new(vec![decide("delegate", json!({"task": "noop", "max_steps": 0}))]);
        let (mut agent, _) = parent(provider, MemoryPeer::echo());

        agent.step(&NoopObserver).await.unwrap();
        assert_eq!(agent.current_step(), 2);
        assert!(agent
            .state()
            .messages
            .last()
            .unwrap()
            .content
            .contains("Sub-agent used 0 steps"));
    }

    #[tokio::test]
    async fn test_fatal_sub_agent_error_becomes_observation() {
        let provider = ScriptedProvider::new(vec![decide("delegate", json!({"task": "x"}))]);
        provider.push_err(LlmError::InvalidResponse("empty choices".into()));
        let (mut agent, _) = parent(provider, MemoryPeer::echo());

        let outcome = agent.step(&NoopObserver).await.unwrap();
        assert_eq!(outcome, StepOutcome::Acted { success: false });
        assert!(agent
            .state()
            .messages
            .last()
            .unwrap()
            .content
            .contains("Sub-agent execution error"));
        // The failed sub-step still consumed a number
        assert_eq!(agent.current_step(), 2);
    }

    #[tokio::test]
    async fn test_sub_task_complete_does_not_end_parent() {
        let provider = ScriptedProvider::new(vec![
            decide("delegate", json!({"task": "x"})),
            decide("sub_task_complete", json!({"summary": "done"})),
        ]);
        let (mut agent, _) = parent(provider, MemoryPeer::echo());

        let outcome = agent.step(&NoopObserver).await.unwrap();
        assert_eq!(outcome, StepOutcome::Acted { success: true });
        assert!(!agent.is_finished());
    }
}
