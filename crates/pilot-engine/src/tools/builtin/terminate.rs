use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::TERMINATE;
use crate::tools::{ParameterProperty, ParameterSchema, Tool, ToolContext, ToolResult};

/// Ends the main agent's run
pub struct TerminateTool;

#[async_trait]
impl Tool for TerminateTool {
    fn name(&self) -> &str {
        TERMINATE
    }

    fn description(&self) -> &str {
        "Terminate the interaction when the request is met or cannot proceed further."
    }

    fn parameters_schema(&self) -> ParameterSchema {
        ParameterSchema::new().with_required(
            "status",
            ParameterProperty::string("The finish status of the interaction").with_enum(["success", "failure"]),
        )
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let status = args["status"].as_str().unwrap_or("success");
        Ok(ToolResult::success(format!(
            "The interaction has been completed with status: {}",
            status
        )))
    }
}
