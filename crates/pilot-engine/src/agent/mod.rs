//! Agent framework: think/act loop, plan, and execution records

mod agent_loop;
pub mod history;
pub mod observer;
pub mod plan;
pub mod prompt;
pub mod proven;
mod state;

pub use agent_loop::{AgentLoop, StepOutcome};
pub use observer::{NoopObserver, StepObserver};
pub use plan::{Plan, PlanStep, SharedPlan, StepStatus};
pub use proven::{ProvenAction, ProvenCall, ProvenStep, ProvenStepTracker};
pub use state::{
    Actor, AgentConfig, AgentState, HistoryEntry, InterventionRecord, StepRecord, ToolCallRecord,
};
