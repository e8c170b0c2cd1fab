//! Persistence seams and a JSON-file implementation
//!
//! Units, sessions and runs live in separate directories under one base
//! directory, one pretty-printed JSON document per record.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::proven::{flatten, group};
use crate::agent::{HistoryEntry, ProvenAction, ProvenStep};
use crate::controller::SessionStatus;
use crate::deps::{DependencyGraph, DependencyNode};
use crate::error::ResolveError;

/// A test unit: what to run and what it depends on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Instructions the agent works from
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyNode>,
    #[serde(default)]
    pub proven_steps: Vec<ProvenAction>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UnitRecord {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_dependencies(mut self, dependencies: DependencyNode) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    /// Stored proven actions regrouped into steps
    pub fn steps(&self) -> Vec<ProvenStep> {
        group(&self.proven_steps)
    }
}

/// Persisted view of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub unit_id: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub prompt: String,
    pub status: SessionStatus,
    pub peer_id: Option<String>,
    /// Only set while the peer is alive
    pub live_url: Option<String>,
    pub current_step: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub proven_steps: Vec<ProvenAction>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            unit_id: None,
            user_id: None,
            tenant_id: None,
            prompt: prompt.into(),
            status: SessionStatus::Initializing,
            peer_id: None,
            live_url: None,
            current_step: 0,
            history: Vec::new(),
            proven_steps: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn set_proven_steps(&mut self, steps: &[ProvenStep]) {
        self.proven_steps = flatten(steps);
        self.updated_at = Utc::now();
    }
}

/// Status of one unit within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRunResult {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    #[serde(default)]
    pub units: BTreeMap<String, UnitRunResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            units: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub trait UnitStore: Send + Sync {
    fn load_unit(&self, id: &str) -> Result<Option<UnitRecord>>;

    fn save_unit(&self, unit: &UnitRecord) -> Result<()>;

    /// Replace a unit's proven steps
    fn save_proven_steps(&self, id: &str, steps: &[ProvenStep]) -> Result<()> {
        let mut unit = self
            .load_unit(id)?
            .with_context(|| format!("Unit not found: {}", id))?;
        unit.proven_steps = flatten(steps);
        unit.updated_at = Some(Utc::now());
        self.save_unit(&unit)
    }
}

pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &SessionRecord) -> Result<()>;

    fn load_session(&self, id: &str) -> Result<Option<SessionRecord>>;
}

pub trait RunStore: Send + Sync {
    fn load_run(&self, id: &str) -> Result<Option<RunRecord>>;

    fn save_run(&self, run: &RunRecord) -> Result<()>;

    /// Read-modify-write of one unit's entry; concurrent writers are last-write-wins
    fn record_unit_result(&self, run_id: &str, unit_id: &str, result: UnitRunResult) -> Result<()>;
}

/// Dependency graph view over a [`UnitStore`]
pub struct UnitGraph<'a>(pub &'a dyn UnitStore);

impl DependencyGraph for UnitGraph<'_> {
    fn node(&self, id: &str) -> Result<Option<DependencyNode>, ResolveError> {
        self.0
            .load_unit(id)
            .map(|unit| unit.map(|u| u.dependencies.unwrap_or_default()))
            .map_err(|e| ResolveError::Store {
                id: id.to_string(),
                reason: format!("{:#}", e),
            })
    }
}

/// JSON-file store
pub struct JsonStore {
    base_dir: PathBuf,
    /// Serialises run updates from this process
    run_lock: Mutex<()>,
}

impl JsonStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        for kind in ["units", "sessions", "runs"] {
            let dir = base_dir.join(kind);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create store directory {}", dir.display()))?;
        }
        debug!(path = %base_dir.display(), "Opened JSON store");
        Ok(Self {
            base_dir,
            run_lock: Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path(&self, kind: &str, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            bail!("Invalid record id: {:?}", id);
        }
        Ok(self.base_dir.join(kind).join(format!("{}.json", id)))
    }

    fn read<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        let path = self.path(kind, id)?;
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn write<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        let path = self.path(kind, id)?;
        let json = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))
    }
}

impl UnitStore for JsonStore {
    fn load_unit(&self, id: &str) -> Result<Option<UnitRecord>> {
        self.read("units", id)
    }

    fn save_unit(&self, unit: &UnitRecord) -> Result<()> {
        self.write("units", &unit.id, unit)?;
        info!(unit_id = %unit.id, proven_actions = unit.proven_steps.len(), "Saved unit");
        Ok(())
    }
}

impl SessionStore for JsonStore {
    fn save_session(&self, session: &SessionRecord) -> Result<()> {
        self.write("sessions", &session.id, session)?;
        debug!(session_id = %session.id, status = ?session.status, "Saved session");
        Ok(())
    }

    fn load_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.read("sessions", id)
    }
}

impl RunStore for JsonStore {
    fn load_run(&self, id: &str) -> Result<Option<RunRecord>> {
        self.read("runs", id)
    }

    fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.write("runs", &run.id, run)
    }

    fn record_unit_result(&self, run_id: &str, unit_id: &str, result: UnitRunResult) -> Result<()> {
        let _guard = self.run_lock.lock();
        let mut run = self
            .load_run(run_id)?
            .unwrap_or_else(|| RunRecord::new(run_id));
        info!(run_id, unit_id, status = ?result.status, "Recording unit result");
        run.updated_at = result.updated_at;
        run.units.insert(unit_id.to_string(), result);
        self.save_run(&run)
    }
}
