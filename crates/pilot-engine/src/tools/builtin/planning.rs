use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::PLANNING;
use crate::agent::plan::{SharedPlan, StepStatus};
use crate::tools::{ParameterProperty, ParameterSchema, Tool, ToolContext, ToolResult};

/// Create and track the task plan
pub struct PlanningTool {
    plan: SharedPlan,
}

impl PlanningTool {
    pub fn new(plan: SharedPlan) -> Self {
        Self { plan }
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[async_trait]
impl Tool for PlanningTool {
    fn name(&self) -> &str {
        PLANNING
    }

    fn description(&self) -> &str {
        "Manage the task plan. Create it once, mark a step in_progress before working on it \
         and completed when it is done. Only one step may be in progress at a time."
    }

    fn parameters_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with_required(
                "command",
                ParameterProperty::string("Planning command")
                    .with_enum(["create", "update", "mark_step", "get"]),
            )
            .with_property("title", ParameterProperty::string("Plan title, for 'create'"))
            .with_property("steps", ParameterProperty::string_array("Step descriptions, for 'create' and 'update'"))
            .with_property("step_index", ParameterProperty::integer("Step index, for 'mark_step'"))
            .with_property(
                "step_status",
                ParameterProperty::string("New status, for 'mark_step'")
                    .with_enum(["not_started", "in_progress", "completed", "blocked"]),
            )
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let command = args["command"].as_str().unwrap_or_default();
        let mut plan = self.plan.lock();

        let result = match command {
            "create" => {
                let Some(steps) = string_list(args.get("steps")).filter(|s| !s.is_empty()) else {
                    return Ok(ToolResult::error("'steps' must be a non-empty list of strings"));
                };
                let title = args["title"].as_str().unwrap_or("Task plan");
                plan.create(title, steps);
                ToolResult::success(format!("Plan created\n\n{}", plan.render()))
            }
            "update" => {
                if plan.is_empty() {
                    return Ok(ToolResult::error("No plan has been created yet"));
                }
                let Some(steps) = string_list(args.get("steps")) else {
                    return Ok(ToolResult::error("'steps' must be a list of strings"));
                };
                if let Some(title) = args["title"].as_str() {
                    plan.title = title.to_string();
                }
                plan.replace_steps(steps);
                ToolResult::success(format!("Plan updated\n\n{}", plan.render()))
            }
            "mark_step" => {
                let Some(index) = args["step_index"].as_u64() else {
                    return Ok(ToolResult::error("'step_index' is required for mark_step"));
                };
                let status = match args["step_status"].as_str().unwrap_or("completed").parse::<StepStatus>() {
                    Ok(status) => status,
                    Err(e) => return Ok(ToolResult::error(e.to_string())),
                };
                match plan.mark(index as usize, status) {
                    Ok(()) => ToolResult::success(format!(
                        "Step {} updated\n\n{}",
                        index,
                        plan.render()
                    )),
                    Err(e) => ToolResult::error(e.to_string()),
                }
            }
            "get" => {
                if plan.is_empty() {
                    ToolResult::error("No plan has been created yet")
                } else {
                    ToolResult::success(plan.render())
                }
            }
            other => ToolResult::error(format!(
                "Unrecognized command: {}. Allowed commands are: create, update, mark_step, get",
                other
            )),
        };
        Ok(result)
    }
}
