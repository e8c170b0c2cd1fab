//! Browser tool backed by the RPC channel
//!
//! Agent-facing actions are translated to peer commands here. Locator-based
//! `click` and `fill` become `click_locator` and `fill_locator`, `send_keys`
//! becomes `press` or `type`, and `wait` never reaches the peer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::BROWSER;
use crate::rpc::{Command, RpcChannel};
use crate::tools::{ParameterProperty, ParameterSchema, Tool, ToolContext, ToolResult};

const ACTIONS: &[&str] = &[
    "navigate_to",
    "go_back",
    "wait",
    "click",
    "fill",
    "send_keys",
    "scroll_down",
    "scroll_up",
    "scroll_to_text",
    "get_dropdown_options",
    "select_dropdown_option",
    "click_coordinates",
    "drag_drop",
    "get_elements",
    "get_by_role",
    "get_by_text",
    "get_by_label",
    "get_by_placeholder",
    "get_headings",
    "get_buttons",
    "get_links",
    "get_inputs",
    "wait_for_load_state",
    "assert_element_visible",
    "assert_element_hidden",
    "assert_text_contains",
    "assert_url_contains",
    "assert_count_equals",
    "assert_has_value",
];

/// Actions that change page state and therefore belong in a replay
const STATE_CHANGING: &[&str] = &[
    "navigate_to",
    "click",
    "fill",
    "send_keys",
    "go_back",
    "scroll_down",
    "scroll_up",
    "scroll_to_text",
    "select_dropdown_option",
    "drag_drop",
    "click_coordinates",
];

const NAMED_KEYS: &[&str] = &[
    "Enter",
    "Tab",
    "Escape",
    "Backspace",
    "Delete",
    "ArrowUp",
    "ArrowDown",
    "ArrowLeft",
    "ArrowRight",
    "Home",
    "End",
    "PageUp",
    "PageDown",
    "Space",
];

const DEFAULT_WAIT_SECS: u64 = 3;
const MAX_WAIT_SECS: u64 = 30;

/// Click locators in priority order: (argument, locator type)
const CLICK_LOCATORS: &[(&str, &str)] = &[
    ("by_text", "text"),
    ("by_role", "role"),
    ("by_placeholder", "placeholder"),
    ("by_label", "label"),
    ("by_test_id", "testid"),
    ("by_id", "id"),
    ("by_css", "css"),
];

/// Fill prefers form-oriented locators
const FILL_LOCATORS: &[(&str, &str)] = &[
    ("by_placeholder", "placeholder"),
    ("by_label", "label"),
    ("by_test_id", "testid"),
    ("by_id", "id"),
    ("by_css", "css"),
    ("by_text", "text"),
];

pub fn is_assertion(action: &str) -> bool {
    action.starts_with("assert_")
}

/// Whether a successful call with this action is worth replaying
pub fn is_replayable_action(action: &str) -> bool {
    STATE_CHANGING.contains(&action) || is_assertion(action)
}

fn is_key_press(keys: &str) -> bool {
    NAMED_KEYS.contains(&keys) || (keys.len() > 1 && keys.contains('+') && !keys.contains(' '))
}

/// Browser automation through the remote peer
pub struct BrowserTool {
    channel: Arc<RpcChannel>,
}

impl BrowserTool {
    pub fn new(channel: Arc<RpcChannel>) -> Self {
        Self { channel }
    }

    async fn run(&self, command: Command, fallback_error: &str) -> ToolResult {
        match self.channel.send(&command).await {
            Ok(response) if response.success => ToolResult::success(response.summary()),
            Ok(response) => {
                ToolResult::error(response.error.unwrap_or_else(|| fallback_error.to_string()))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn click(&self, args: &Map<String, Value>) -> ToolResult {
        if args.contains_key("index") {
            return ToolResult::error(
                "click(index=...) is not supported. Use a locator instead, e.g. \
                 click(by_text='Sign In') or click(by_role='button', has_text='Submit')",
            );
        }
        let Some(mut locator) = locator(args, CLICK_LOCATORS) else {
            return ToolResult::error(
                "click requires a locator: by_text, by_role, by_placeholder, by_label, by_test_id, by_id or by_css",
            );
        };
        if let Some(has_text) = str_arg(args, "has_text") {
            locator.insert("has_text".to_string(), json!(has_text));
        }
        self.run(
            Command::new("click_locator").with_param("locator", Value::Object(locator)),
            "Click failed",
        )
        .await
    }

    async fn fill(&self, args: &Map<String, Value>) -> ToolResult {
        let Some(text) = str_arg(args, "text") else {
            return ToolResult::error("Text is required for fill action");
        };
        let Some(locator) = locator(args, FILL_LOCATORS) else {
            return ToolResult::error(
                "fill requires a locator: by_placeholder, by_label, by_test_id, by_id, by_css or by_text",
            );
        };
        self.run(
            Command::new("fill_locator")
                .with_param("locator", Value::Object(locator))
                .with_param("text", text),
            "Fill failed",
        )
        .await
    }

    async fn navigate(&self, args: &Map<String, Value>) -> ToolResult {
        let Some(url) = str_arg(args, "url") else {
            return ToolResult::error("URL is required for navigation");
        };
        match self.channel.send(&Command::new("navigate").with_param("url", url)).await {
            Ok(response) if response.success => {
                let payload = &response.payload;
                let mut text = format!(
                    "Successfully navigated to {}",
                    payload.get("url").and_then(Value::as_str).unwrap_or(url)
                );
                if let Some(title) = payload.get("title").and_then(Value::as_str) {
                    text.push_str(&format!("\nTitle: {}", title));
                }
                if let Some(message) = response.message() {
                    text.push_str(&format!("\n{}", message));
                }
                ToolResult::success(text)
            }
            Ok(response) => {
                ToolResult::error(response.error.unwrap_or_else(|| "Navigation failed".to_string()))
            }
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    async fn send_keys(&self, args: &Map<String, Value>) -> ToolResult {
        let Some(keys) = str_arg(args, "keys") else {
            return ToolResult::error("Keys are required");
        };
        let command = if is_key_press(keys) {
            Command::new("press").with_param("key", keys)
        } else {
            Command::new("type").with_param("text", keys)
        };
        match self.run(command, "Send keys failed").await {
            result if result.success => ToolResult::success(format!("Sent keys: {}", keys)),
            failed => failed,
        }
    }

    async fn wait(&self, args: &Map<String, Value>) -> ToolResult {
        let seconds = args
            .get("seconds")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_WAIT_SECS)
            .min(MAX_WAIT_SECS);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        ToolResult::success(format!("Waited for {} seconds", seconds))
    }

    /// Anything else goes to the peer as-is
    async fn forward(&self, action: &str, args: &Map<String, Value>) -> ToolResult {
        let mut command = Command::new(action);
        for (key, value) in args.iter().filter(|(k, _)| k.as_str() != "action") {
            command.params.insert(key.clone(), value.clone());
        }
        self.run(command, &format!("{} failed", action)).await
    }
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn locator(args: &Map<String, Value>, order: &[(&str, &str)]) -> Option<Map<String, Value>> {
    order.iter().find_map(|(key, kind)| {
        str_arg(args, key).map(|value| {
            let mut locator = Map::new();
            locator.insert("type".to_string(), json!(kind));
            locator.insert("value".to_string(), json!(value));
            locator
        })
    })
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        BROWSER
    }

    fn description(&self) -> &str {
        "Control the browser in the remote sandbox. Navigate, click and fill using stable \
         locators (by_text, by_role, by_placeholder, by_label, by_id, by_css), inspect the page \
         with the get_* actions and verify outcomes with the assert_* actions."
    }

    fn parameters_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with_required(
                "action",
                ParameterProperty::string("The browser action to perform").with_enum(ACTIONS.iter().copied()),
            )
            .with_property("url", ParameterProperty::string("URL for 'navigate_to'"))
            .with_property("text", ParameterProperty::string("Text for fill or scroll_to_text"))
            .with_property("keys", ParameterProperty::string("Keys for 'send_keys'; named keys and chords are pressed, anything else is typed"))
            .with_property("seconds", ParameterProperty::integer("Seconds to wait (max 30)"))
            .with_property("amount", ParameterProperty::integer("Pixel amount to scroll"))
            .with_property("by_text", ParameterProperty::string("Locate element by visible text"))
            .with_property("by_role", ParameterProperty::string("Locate element by ARIA role"))
            .with_property("by_placeholder", ParameterProperty::string("Locate input by placeholder"))
            .with_property("by_label", ParameterProperty::string("Locate input by its label"))
            .with_property("by_test_id", ParameterProperty::string("Locate element by data-testid"))
            .with_property("by_id", ParameterProperty::string("Locate element by id attribute"))
            .with_property("by_css", ParameterProperty::string("Locate element by CSS selector"))
            .with_property("has_text", ParameterProperty::string("Narrow by_role or by_css matches by text"))
            .with_property("role", ParameterProperty::string("ARIA role for 'get_by_role'"))
            .with_property("search_text", ParameterProperty::string("Text for 'get_by_text' and count assertions"))
            .with_property("label", ParameterProperty::string("Label for 'get_by_label'"))
            .with_property("placeholder_text", ParameterProperty::string("Placeholder for 'get_by_placeholder'"))
            .with_property("load_state", ParameterProperty::string("Load state for 'wait_for_load_state'"))
            .with_property("expected_text", ParameterProperty::string("Expected text for URL/text assertions"))
            .with_property("expected_count", ParameterProperty::integer("Expected element count for 'assert_count_equals'"))
            .with_property("expected_value", ParameterProperty::string("Expected input value for 'assert_has_value'"))
            .with_property("assertion_description", ParameterProperty::string("What the assertion verifies"))
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let empty = Map::new();
        let args = args.as_object().unwrap_or(&empty);
        let action = args.get("action").and_then(Value::as_str).unwrap_or_default();
        debug!(action, "Browser action");

        let result = match action {
            "navigate_to" => self.navigate(args).await,
            "click" => self.click(args).await,
            "fill" => self.fill(args).await,
            "send_keys" => self.send_keys(args).await,
            "wait" => self.wait(args).await,
            "" => ToolResult::error("action is required"),
            other => self.forward(other, args).await,
        };
        Ok(result)
    }
}
