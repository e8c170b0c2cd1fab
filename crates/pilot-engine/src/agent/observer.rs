use async_trait::async_trait;
use llm_core::ToolCall;

use super::state::StepRecord;

/// Receives step progress from an agent loop
#[async_trait]
pub trait StepObserver: Send + Sync {
    /// Called before the planned calls are dispatched
    async fn step_started(&self, step: u64, calls: &[ToolCall]);

    /// Called for every step record appended to the history
    async fn step_completed(&self, record: &StepRecord);
}

/// Observer that ignores everything
pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn step_started(&self, _step: u64, _calls: &[ToolCall]) {}

    async fn step_completed(&self, _record: &StepRecord) {}
}
