//! Replay of proven steps without the LLM

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::agent::ProvenStep;
use crate::tools::builtin::{is_assertion, BROWSER};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::ToolContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Passed,
    Failed,
}

/// Outcome of one replayed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayedCall {
    pub step_index: usize,
    pub tool_name: String,
    pub action: Option<String>,
    pub success: bool,
    pub observation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub status: ReplayStatus,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ReplayedCall>,
}

/// Dispatch every recorded call in order
///
/// A failed assertion stops the replay. Other failures are counted and the
/// replay moves on.
#[instrument(skip(dispatcher, steps, ctx), fields(session_id = %ctx.session_id, steps = steps.len()))]
pub async fn replay(dispatcher: &Dispatcher, steps: &[ProvenStep], ctx: &ToolContext) -> ReplayReport {
    let mut results = Vec::new();
    let mut stopped = false;

    'steps: for step in steps {
        info!(step_index = step.index, description = %step.description, "Replaying step");
        for call in &step.tool_calls {
            let outcome = dispatcher
                .dispatch_value(&call.tool_name, &call.arguments, ctx)
                .await;
            let success = outcome.is_success();
            let action = call.arguments["action"].as_str().map(str::to_string);
            let assertion = call.tool_name == BROWSER && action.as_deref().is_some_and(is_assertion);

            results.push(ReplayedCall {
                step_index: step.index,
                tool_name: call.tool_name.clone(),
                action,
                success,
                observation: outcome.observation(&call.tool_name),
            });

            if !success && assertion {
                warn!(step_index = step.index, "Assertion failed, stopping replay");
                stopped = true;
                break 'steps;
            }
        }
    }

    let passed = results.iter().filter(|r| r.success).count();
    let failed = results.len() - passed;
    let status = if failed == 0 && !stopped {
        ReplayStatus::Passed
    } else {
        ReplayStatus::Failed
    };
    info!(passed, failed, ?status, "Replay finished");

    ReplayReport {
        status,
        passed,
        failed,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ProvenCall;
    use crate::config::ChannelConfig;
    use crate::rpc::RpcChannel;
    use crate::testing::{MemoryPeer, PeerReply};
    use crate::tools::builtin::BrowserTool;
    use crate::tools::registry::ToolRegistry;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn dispatcher(peer: Arc<MemoryPeer>) -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(BrowserTool::new(Arc::new(RpcChannel::new(
            peer,
            ChannelConfig::default(),
        ))));
        Dispatcher::new(registry)
    }

    fn step(index: usize, calls: Vec<Value>) -> ProvenStep {
        ProvenStep {
            index,
            description: format!("step {}", index),
            tool_calls: calls
                .into_iter()
                .map(|arguments| ProvenCall {
                    tool_name: BROWSER.to_string(),
                    arguments,
                })
                .collect(),
        }
    }

    /// Fails every command whose action is listed
    fn failing(actions: &'static [&'static str]) -> Arc<MemoryPeer> {
        MemoryPeer::new(move |cmd| {
            if actions.contains(&cmd.action.as_str()) {
                PeerReply::Json(json!({"success": false, "error": format!("{} failed", cmd.action)}))
            } else {
                PeerReply::Json(json!({"success": true, "message": "ok"}))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_calls_pass() {
        let peer = MemoryPeer::echo();
        let steps = vec![
            step(0, vec![json!({"action": "navigate_to", "url": "https://a"})]),
            step(1, vec![json!({"action": "click", "by_text": "Go"})]),
        ];

        let report = replay(&dispatcher(peer.clone()), &steps, &ToolContext::new("r")).await;
        assert_eq!(report.status, ReplayStatus::Passed);
        assert_eq!(report.passed, 2);
        assert_eq!(peer.command_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_assertion_stops_replay() {
        let peer = failing(&["assert_url_contains"]);
        let steps = vec![
            step(0, vec![json!({"action": "assert_url_contains", "expected_text": "/home"})]),
            step(1, vec![json!({"action": "click", "by_text": "Go"})]),
        ];

        let report = replay(&dispatcher(peer.clone()), &steps, &ToolContext::new("r")).await;
        assert_eq!(report.status, ReplayStatus::Failed);
        assert_eq!(report.results.len(), 1);
        assert_eq!(peer.command_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_continue() {
        let peer = failing(&["click_locator"]);
        let steps = vec![step(
            0,
            vec![
                json!({"action": "click", "by_text": "Maybe"}),
                json!({"action": "scroll_down"}),
            ],
        )];

        let report = replay(&dispatcher(peer), &steps, &ToolContext::new("r")).await;
        assert_eq!(report.status, ReplayStatus::Failed);
        assert_eq!((report.passed, report.failed), (1, 1));
    }
}
