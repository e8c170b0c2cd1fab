//! Batch runs over several units

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::controller::{wait_for_outcome, SessionController, SessionStatus, StartRequest};
use crate::store::{RunRecord, RunStore, UnitRunResult, UnitStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Sequential,
    Parallel,
}

/// Runs each unit as its own session and records the outcomes in a run
pub struct BatchRunner {
    controller: SessionController,
    runs: Arc<dyn RunStore>,
    units: Arc<dyn UnitStore>,
}

impl BatchRunner {
    pub fn new(controller: SessionController, runs: Arc<dyn RunStore>, units: Arc<dyn UnitStore>) -> Self {
        Self {
            controller,
            runs,
            units,
        }
    }

    #[instrument(skip(self, unit_ids), fields(units = unit_ids.len()))]
    pub async fn execute(&self, run_id: &str, unit_ids: &[String], mode: BatchMode) -> Result<RunRecord> {
        if self.runs.load_run(run_id)?.is_none() {
            self.runs.save_run(&RunRecord::new(run_id))?;
        }

        match mode {
            BatchMode::Sequential => {
                for unit_id in unit_ids {
                    self.run_unit(run_id, unit_id).await?;
                }
            }
            BatchMode::Parallel => {
                let outcomes = join_all(unit_ids.iter().map(|id| self.run_unit(run_id, id))).await;
                for outcome in outcomes {
                    outcome?;
                }
            }
        }

        let run = self
            .runs
            .load_run(run_id)?
            .with_context(|| format!("Run not found after execution: {}", run_id))?;
        info!(run_id, completed = run.units.values().filter(|r| r.status == SessionStatus::Completed).count(), "Batch finished");
        Ok(run)
    }

    async fn run_unit(&self, run_id: &str, unit_id: &str) -> Result<SessionStatus> {
        let unit = match self.units.load_unit(unit_id) {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                warn!(run_id, unit_id, "Unit not found");
                return self.record(run_id, unit_id, SessionStatus::Error, None);
            }
            Err(e) => {
                warn!(run_id, unit_id, error = %e, "Failed to load unit");
                return self.record(run_id, unit_id, SessionStatus::Error, None);
            }
        };

        let prompt = if unit.prompt.is_empty() {
            unit.name.clone()
        } else {
            unit.prompt.clone()
        };
        let (session_id, mut events) = self
            .controller
            .start(StartRequest::new(prompt).with_unit(unit_id));
        self.record(run_id, unit_id, SessionStatus::Running, Some(session_id.clone()))?;

        let status = wait_for_outcome(&mut events).await;
        info!(run_id, unit_id, %session_id, %status, "Unit finished");
        self.record(run_id, unit_id, status, Some(session_id))
    }

    fn record(
        &self,
        run_id: &str,
        unit_id: &str,
        status: SessionStatus,
        session_id: Option<String>,
    ) -> Result<SessionStatus> {
        self.runs.record_unit_result(
            run_id,
            unit_id,
            UnitRunResult {
                status,
                session_id,
                updated_at: Utc::now(),
            },
        )?;
        Ok(status)
    }
}
