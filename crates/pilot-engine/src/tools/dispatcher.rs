//! Tool dispatch
//!
//! Every outcome, including unknown tools and bad arguments, comes back as a
//! [`DispatchOutcome`] that renders to an observation. Nothing a tool does
//! can abort the agent loop from here.

use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::registry::ToolRegistry;
use super::{ToolContext, ToolResult};

/// Result of dispatching a tool call
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Tool ran; the result may still carry a logical failure
    Completed(ToolResult),
    /// No tool with that name
    ToolNotFound(String),
    /// Arguments were not a JSON object or missed a required parameter
    InvalidArguments { tool: String, reason: String },
    /// The handler itself failed
    Error { tool: String, message: String },
}

impl DispatchOutcome {
    /// True only for a tool that ran and reported success
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Completed(result) if result.success)
    }

    pub fn into_result(self) -> Option<ToolResult> {
        match self {
            DispatchOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }

    /// Text fed back to the model for a call to `name`
    pub fn observation(&self, name: &str) -> String {
        match self {
            DispatchOutcome::Completed(result) => {
                let text = result.text();
                if text.is_empty() {
                    format!("Cmd `{}` completed with no output", name)
                } else {
                    format!("Observed output of cmd `{}` executed:\n{}", name, text)
                }
            }
            DispatchOutcome::ToolNotFound(tool) => format!("Error: Unknown tool '{}'", tool),
            DispatchOutcome::InvalidArguments { tool, reason } => {
                format!("Error: Invalid arguments for {}: {}", tool, reason)
            }
            DispatchOutcome::Error { tool, message } => {
                format!("Error: Tool '{}' encountered a problem: {}", tool, message)
            }
        }
    }
}

/// Looks up tools by name and runs them with validated arguments
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ToolRegistry,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Dispatch a call whose arguments are raw JSON text
    #[instrument(skip(self, arguments, ctx), fields(tool = %name, step = ctx.step))]
    pub async fn dispatch(&self, name: &str, arguments: &str, ctx: &ToolContext) -> DispatchOutcome {
        let Some(tool) = self.registry.get(name) else {
            warn!(tool = %name, "Tool not found");
            return DispatchOutcome::ToolNotFound(name.to_string());
        };

        let args = match parse_arguments(arguments) {
            Ok(args) => args,
            Err(reason) => {
                warn!(tool = %name, reason = %reason, "Rejected tool arguments");
                return DispatchOutcome::InvalidArguments {
                    tool: name.to_string(),
                    reason,
                };
            }
        };

        let schema = tool.parameters_schema();
        if let Some(missing) = schema.required.iter().find(|p| !args.contains_key(p.as_str())) {
            warn!(tool = %name, parameter = %missing, "Missing required parameter");
            return DispatchOutcome::InvalidArguments {
                tool: name.to_string(),
                reason: format!("missing required parameter '{}'", missing),
            };
        }

        debug!(tool = %name, "Executing tool");
        match tool.execute(&Value::Object(args), ctx).await {
            Ok(result) => {
                if result.success {
                    info!(tool = %name, output_len = result.output.len(), "Tool executed successfully");
                } else {
                    warn!(tool = %name, error = ?result.error, "Tool reported failure");
                }
                DispatchOutcome::Completed(result)
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool execution error");
                DispatchOutcome::Error {
                    tool: name.to_string(),
                    message: format!("{:#}", e),
                }
            }
        }
    }

    /// Dispatch a call whose arguments are already parsed
    pub async fn dispatch_value(&self, name: &str, args: &Value, ctx: &ToolContext) -> DispatchOutcome {
        self.dispatch(name, &args.to_string(), ctx).await
    }
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ParameterProperty, ParameterSchema, Tool};
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes the input"
        }

        fn parameters_schema(&self) -> ParameterSchema {
            ParameterSchema::new().with_required("message", ParameterProperty::string("Message to echo"))
        }

        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolResult> {
            let message = args["message"].as_str().unwrap_or_default();
            match message {
                "fail" => Ok(ToolResult::error("asked to fail")),
                "crash" => bail!("handler blew up"),
                other => Ok(ToolResult::success(other)),
            }
        }
    }

    struct NoArgsTool;

    #[async_trait]
    impl Tool for NoArgsTool {
        fn name(&self) -> &str {
            "noop"
        }

        fn description(&self) -> &str {
            "Does nothing"
        }

        fn parameters_schema(&self) -> ParameterSchema {
            ParameterSchema::new()
        }

        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<ToolResult> {
            Ok(ToolResult::success(""))
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(NoArgsTool);
        Dispatcher::new(registry)
    }

    fn ctx() -> ToolContext {
        ToolContext::new("test-session")
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let outcome = dispatcher().dispatch("echo", r#"{"message": "hello"}"#, &ctx()).await;
        assert!(outcome.is_success());
        assert_eq!(
            outcome.observation("echo"),
            "Observed output of cmd `echo` executed:\nhello"
        );
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let outcome = dispatcher().dispatch("nope", "{}", &ctx()).await;
        assert!(matches!(outcome, DispatchOutcome::ToolNotFound(ref name) if name == "nope"));
        assert_eq!(outcome.observation("nope"), "Error: Unknown tool 'nope'");
    }

    #[tokio::test]
    async fn test_malformed_and_non_object_arguments() {
        let d = dispatcher();
        let outcome = d.dispatch("echo", "{not json", &ctx()).await;
        assert!(matches!(outcome, DispatchOutcome::InvalidArguments { .. }));

        let outcome = d.dispatch("echo", "[1, 2]", &ctx()).await;
        match outcome {
            DispatchOutcome::InvalidArguments { reason, .. } => assert!(reason.contains("an array")),
            other => panic!("expected invalid arguments, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_required_parameter() {
        let outcome = dispatcher().dispatch("echo", "{}", &ctx()).await;
        assert!(outcome.observation("echo").contains("missing required parameter 'message'"));
    }

    #[tokio::test]
    async fn test_empty_arguments_mean_empty_object() {
        let outcome = dispatcher().dispatch("noop", "", &ctx()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.observation("noop"), "Cmd `noop` completed with no output");
    }

    #[tokio::test]
    async fn test_logical_failure_and_handler_error_are_observations() {
        let d = dispatcher();
        let failed = d.dispatch("echo", r#"{"message": "fail"}"#, &ctx()).await;
        assert!(!failed.is_success());
        assert!(failed.observation("echo").ends_with("Error: asked to fail"));

        let crashed = d.dispatch("echo", r#"{"message": "crash"}"#, &ctx()).await;
        assert!(matches!(crashed, DispatchOutcome::Error { .. }));
        assert!(crashed.observation("echo").contains("handler blew up"));
    }
}
