//! Task plan owned by the main agent

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of one plan step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl StepStatus {
    fn marker(self) -> &'static str {
        match self {
            StepStatus::NotStarted => "[ ]",
            StepStatus::InProgress => "[→]",
            StepStatus::Completed => "[✓]",
            StepStatus::Blocked => "[!]",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(StepStatus::NotStarted),
            "in_progress" => Ok(StepStatus::InProgress),
            "completed" => Ok(StepStatus::Completed),
            "blocked" => Ok(StepStatus::Blocked),
            other => Err(PlanError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("No plan has been created yet")]
    NoPlan,

    #[error("Step index {index} is out of range (plan has {len} steps)")]
    OutOfRange { index: usize, len: usize },

    #[error("Step {current} is already in progress; complete or block it before starting step {requested}")]
    AlreadyInProgress { current: usize, requested: usize },

    #[error("Invalid step status '{0}'")]
    InvalidStatus(String),
}

/// Title plus ordered steps; at most one step is in progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub title: String,
    pub steps: Vec<PlanStep>,
}

/// Plan shared between the agent loop and the planning tool
pub type SharedPlan = Arc<Mutex<Plan>>;

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Start over with a new title and step list
    pub fn create(&mut self, title: impl Into<String>, steps: Vec<String>) {
        self.title = title.into();
        self.steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, description)| PlanStep {
                index,
                description,
                status: StepStatus::NotStarted,
            })
            .collect();
    }

    /// Replace the step list, keeping the status of steps whose description did not change
    pub fn replace_steps(&mut self, steps: Vec<String>) {
        let previous = std::mem::take(&mut self.steps);
        self.steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, description)| {
                let status = previous
                    .get(index)
                    .filter(|old| old.description == description)
                    .map(|old| old.status)
                    .unwrap_or_default();
                PlanStep {
                    index,
                    description,
                    status,
                }
            })
            .collect();
    }

    pub fn mark(&mut self, index: usize, status: StepStatus) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::NoPlan);
        }
        let len = self.steps.len();
        if index >= len {
            return Err(PlanError::OutOfRange { index, len });
        }
        if status == StepStatus::InProgress {
            if let Some(current) = self.in_progress().filter(|&current| current != index) {
                return Err(PlanError::AlreadyInProgress {
                    current,
                    requested: index,
                });
            }
        }
        self.steps[index].status = status;
        Ok(())
    }

    pub fn in_progress(&self) -> Option<usize> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::InProgress)
            .map(|step| step.index)
    }

    /// Mark the in-progress step, if any, as blocked; returns its index
    pub fn block_in_progress(&mut self) -> Option<usize> {
        let index = self.in_progress()?;
        self.steps[index].status = StepStatus::Blocked;
        Some(index)
    }

    pub fn description(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(|step| step.description.as_str())
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }

    pub fn render(&self) -> String {
        let total = self.steps.len();
        let completed = self.count(StepStatus::Completed);
        let percent = if total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total as f64
        };

        let mut out = format!("Plan: {}\n", self.title);
        out.push_str(&"=".repeat(out.len().saturating_sub(1)));
        out.push('\n');
        out.push_str(&format!(
            "Progress: {}/{} steps completed ({:.1}%)\n",
            completed, total, percent
        ));
        out.push_str(&format!(
            "Status: {} completed, {} in progress, {} blocked, {} not started\n\nSteps:\n",
            completed,
            self.count(StepStatus::InProgress),
            self.count(StepStatus::Blocked),
            self.count(StepStatus::NotStarted),
        ));
        for step in &self.steps {
            out.push_str(&format!(
                "{}. {} {}\n",
                step.index,
                step.status.marker(),
                step.description
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        let mut plan = Plan::default();
        plan.create(
            "Login flow",
            vec!["Open site".into(), "Sign in".into(), "Check dashboard".into()],
        );
        plan
    }

    #[test]
    fn test_single_in_progress_step() {
        let mut plan = plan();
        plan.mark(0, StepStatus::InProgress).unwrap();
        plan.mark(0, StepStatus::InProgress).unwrap();

        let err = plan.mark(1, StepStatus::InProgress).unwrap_err();
        assert_eq!(
            err,
            PlanError::AlreadyInProgress {
                current: 0,
                requested: 1
            }
        );

        plan.mark(0, StepStatus::Completed).unwrap();
        plan.mark(1, StepStatus::InProgress).unwrap();
        assert_eq!(plan.in_progress(), Some(1));
    }

    #[test]
    fn test_mark_out_of_range_and_without_plan() {
        assert_eq!(
            Plan::default().mark(0, StepStatus::Completed),
            Err(PlanError::NoPlan)
        );
        assert!(matches!(
            plan().mark(7, StepStatus::Completed),
            Err(PlanError::OutOfRange { index: 7, len: 3 })
        ));
    }

    #[test]
    fn test_replace_keeps_unchanged_statuses() {
        let mut plan = plan();
        plan.mark(0, StepStatus::Completed).unwrap();
        plan.mark(1, StepStatus::InProgress).unwrap();

        plan.replace_steps(vec!["Open site".into(), "Sign in with SSO".into()]);
        assert_eq!(plan.steps[0].status, StepStatus::Completed);
        assert_eq!(plan.steps[1].status, StepStatus::NotStarted);
        assert_eq!(plan.in_progress(), None);
    }

    #[test]
    fn test_block_in_progress() {
        let mut plan = plan();
        assert_eq!(plan.block_in_progress(), None);
        plan.mark(2, StepStatus::InProgress).unwrap();
        assert_eq!(plan.block_in_progress(), Some(2));
        assert_eq!(plan.steps[2].status, StepStatus::Blocked);
    }

    #[test]
    fn test_render() {
        let mut plan = plan();
        plan.mark(0, StepStatus::Completed).unwrap();
        let text = plan.render();
        assert!(text.starts_with("Plan: Login flow\n"));
        assert!(text.contains("Progress: 1/3 steps completed (33.3%)"));
        assert!(text.contains("0. [✓] Open site"));
        assert!(text.contains("1. [ ] Sign in"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("blocked".parse::<StepStatus>(), Ok(StepStatus::Blocked));
        assert!("done".parse::<StepStatus>().is_err());
    }
}
