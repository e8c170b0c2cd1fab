//! Built-in tools

mod browser;
mod planning;
mod sub_task_complete;
mod terminate;

pub use browser::{is_assertion, is_replayable_action, BrowserTool};
pub use planning::PlanningTool;
pub use sub_task_complete::SubTaskCompleteTool;
pub use terminate::TerminateTool;

pub const BROWSER: &str = "browser";
pub const PLANNING: &str = "planning";
pub const TERMINATE: &str = "terminate";
pub const SUB_TASK_COMPLETE: &str = "sub_task_complete";
pub const DELEGATE: &str = "delegate";
