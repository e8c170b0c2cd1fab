//! Proven steps: replayable call sequences derived from successful calls

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::plan::{Plan, StepStatus};
use crate::tools::builtin::{is_replayable_action, BROWSER, PLANNING};

/// One call known to have succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenCall {
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenStep {
    pub index: usize,
    pub description: String,
    pub tool_calls: Vec<ProvenCall>,
}

/// Flattened artifact entry: `{index, description, toolName, arguments}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenAction {
    pub index: usize,
    pub description: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Flatten steps into the stored artifact form
pub fn flatten(steps: &[ProvenStep]) -> Vec<ProvenAction> {
    steps
        .iter()
        .flat_map(|step| {
            step.tool_calls.iter().map(move |call| ProvenAction {
                index: step.index,
                description: step.description.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
            })
        })
        .collect()
}

/// Regroup stored actions into steps, keeping first-seen order
pub fn group(actions: &[ProvenAction]) -> Vec<ProvenStep> {
    let mut steps: Vec<ProvenStep> = Vec::new();
    for action in actions {
        let call = ProvenCall {
            tool_name: action.tool_name.clone(),
            arguments: action.arguments.clone(),
        };
        match steps.iter_mut().find(|step| step.index == action.index) {
            Some(step) => step.tool_calls.push(call),
            None => steps.push(ProvenStep {
                index: action.index,
                description: action.description.clone(),
                tool_calls: vec![call],
            }),
        }
    }
    steps
}

/// Collects replayable calls per plan step while the agent runs
#[derive(Debug, Clone, Default)]
pub struct ProvenStepTracker {
    open: BTreeMap<usize, Vec<ProvenCall>>,
    completed: BTreeMap<usize, ProvenStep>,
    current: Option<usize>,
}

impl ProvenStepTracker {
    /// Tracker that records into `index` from the start (sub-agents)
    pub fn seeded(index: Option<usize>) -> Self {
        let mut tracker = Self::default();
        if let Some(index) = index {
            tracker.open.insert(index, Vec::new());
            tracker.current = Some(index);
        }
        tracker
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Feed one successful call. With a plan, step state is read from the
    /// plan after the call; without one it comes from the call's arguments.
    pub fn observe(&mut self, tool: &str, args: &Value, plan: Option<&Plan>) {
        match tool {
            PLANNING => match plan {
                Some(plan) => self.sync_with_plan(args, plan),
                None => self.follow_mark_args(args),
            },
            BROWSER => {
                let action = args["action"].as_str().unwrap_or_default();
                if !is_replayable_action(action) {
                    return;
                }
                if let Some(current) = self.current {
                    debug!(step_index = current, action, "Recorded proven call");
                    self.open.entry(current).or_default().push(ProvenCall {
                        tool_name: tool.to_string(),
                        arguments: args.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    fn sync_with_plan(&mut self, args: &Value, plan: &Plan) {
        if args["command"] == "mark_step" {
            let completed = args["step_index"]
                .as_u64()
                .map(|i| i as usize)
                .filter(|&i| plan.steps.get(i).is_some_and(|step| step.status == StepStatus::Completed));
            if let Some(index) = completed {
                self.complete(index, Some(plan));
            }
        }
        self.current = plan.in_progress();
        if let Some(index) = self.current {
            self.open.entry(index).or_default();
        }
    }

    fn follow_mark_args(&mut self, args: &Value) {
        if args["command"] != "mark_step" {
            return;
        }
        let Some(index) = args["step_index"].as_u64().map(|i| i as usize) else {
            return;
        };
        // mark_step without a status completes the step
        match args["step_status"].as_str().unwrap_or("completed").parse::<StepStatus>() {
            Ok(StepStatus::InProgress) => {
                self.open.entry(index).or_default();
                self.current = Some(index);
            }
            Ok(StepStatus::Completed) => self.complete(index, None),
            Ok(_) => {
                if self.current == Some(index) {
                    self.current = None;
                }
            }
            Err(_) => {}
        }
    }

    fn complete(&mut self, index: usize, plan: Option<&Plan>) {
        if self.current == Some(index) {
            self.current = None;
        }
        let Some(calls) = self.open.remove(&index).filter(|calls| !calls.is_empty()) else {
            return;
        };
        let description = plan
            .and_then(|plan| plan.description(index))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Step {}", index));
        debug!(step_index = index, calls = calls.len(), "Proven step completed");
        self.completed.insert(
            index,
            ProvenStep {
                index,
                description,
                tool_calls: calls,
            },
        );
    }

    /// Calls recorded so far for a step that has not completed
    pub fn open_calls(&self, index: usize) -> &[ProvenCall] {
        self.open.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Append calls recorded elsewhere (a delegate) to a step
    pub fn merge(&mut self, index: usize, calls: Vec<ProvenCall>) {
        if calls.is_empty() {
            return;
        }
        match self.completed.get_mut(&index) {
            Some(step) => step.tool_calls.extend(calls),
            None => self.open.entry(index).or_default().extend(calls),
        }
    }

    /// Completed steps in index order
    pub fn finalize(&self) -> Vec<ProvenStep> {
        self.completed.values().cloned().collect()
    }
}
