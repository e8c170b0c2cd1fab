use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::SUB_TASK_COMPLETE;
use crate::tools::{ParameterProperty, ParameterSchema, Tool, ToolContext, ToolResult};

/// Ends a sub-agent's run without ending the parent session
pub struct SubTaskCompleteTool;

#[async_trait]
impl Tool for SubTaskCompleteTool {
    fn name(&self) -> &str {
        SUB_TASK_COMPLETE
    }

    fn description(&self) -> &str {
        "Signal that the delegated sub-task is finished and hand control back to the main agent."
    }

    fn parameters_schema(&self) -> ParameterSchema {
        ParameterSchema::new().with_required(
            "summary",
            ParameterProperty::string("What was accomplished"),
        )
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let summary = args["summary"].as_str().unwrap_or_default();
        Ok(ToolResult::success(format!("Sub-task completed: {}", summary)))
    }
}
