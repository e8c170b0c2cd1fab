//! External control plane for agent sessions
//!
//! Every session runs under one supervising task. The agent loop (producer)
//! runs inline in that task and pushes step events into a bounded queue; a
//! consumer task forwards them to the subscriber and watches the control
//! flags between deliveries. Control operations only flip flags or enqueue
//! messages and return immediately.

mod events;
mod signals;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use llm_core::{ChatMessage, ChatProvider, ToolCall};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use events::{PlannedCall, SessionEvent, SessionStatus};
pub use signals::ControlSignals;

use events::QueueItem;

use crate::agent::{prompt, AgentConfig, AgentLoop, SharedPlan, StepObserver, StepRecord};
use crate::config::EngineConfig;
use crate::delegate::DelegateTool;
use crate::deps::resolve;
use crate::error::{ControlError, SessionError};
use crate::replay::{replay, ReplayStatus};
use crate::rpc::{PeerHandle, PeerProvisioner, RpcChannel};
use crate::store::{SessionRecord, SessionStore, UnitGraph, UnitStore};
use crate::tools::builtin::{BrowserTool, PlanningTool, TerminateTool};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::registry::ToolRegistry;
use crate::tools::{Tool, ToolContext};

/// Parameters of a new session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub prompt: String,
    pub unit_id: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Overrides `agent.max_steps`
    pub max_steps: Option<u64>,
}

impl StartRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// Snapshot of an active session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub unit_id: Option<String>,
    pub current_step: u64,
    pub started_at: DateTime<Utc>,
}

/// Control-plane view of a running session
#[derive(Clone)]
struct SessionHandle {
    signals: Arc<ControlSignals>,
    inbox: Arc<Mutex<VecDeque<String>>>,
    status: Arc<Mutex<SessionStatus>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    unit_id: Option<String>,
    started_at: DateTime<Utc>,
}

impl SessionHandle {
    fn emit(&self, event: SessionEvent) {
        // A dropped subscriber does not stop the session
        let _ = self.events.send(event);
    }
}

struct Inner {
    config: EngineConfig,
    provider: Arc<dyn ChatProvider>,
    provisioner: Arc<dyn PeerProvisioner>,
    sessions: Arc<dyn SessionStore>,
    units: Option<Arc<dyn UnitStore>>,
    active: DashMap<String, SessionHandle>,
}

/// Starts sessions and relays control commands to them
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// `units` enables dependency chains and proven-step persistence
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn ChatProvider>,
        provisioner: Arc<dyn PeerProvisioner>,
        sessions: Arc<dyn SessionStore>,
        units: Option<Arc<dyn UnitStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                provisioner,
                sessions,
                units,
                active: DashMap::new(),
            }),
        }
    }

    /// Start a session; progress arrives on the returned receiver
    pub fn start(&self, request: StartRequest) -> (String, mpsc::UnboundedReceiver<SessionEvent>) {
        let id = Uuid::new_v4().to_string();
        let (events, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            signals: Arc::new(ControlSignals::new()),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            status: Arc::new(Mutex::new(SessionStatus::Initializing)),
            events,
            unit_id: request.unit_id.clone(),
            started_at: Utc::now(),
        };
        self.inner.active.insert(id.clone(), handle.clone());
        info!(session_id = %id, unit_id = ?request.unit_id, "Session starting");

        let supervisor = Supervisor::new(self.inner.clone(), id.clone(), request, handle);
        tokio::spawn(supervisor.run());
        (id, rx)
    }

    fn handle(&self, id: &str) -> Result<SessionHandle, ControlError> {
        self.inner
            .active
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    pub fn pause(&self, id: &str) -> Result<(), ControlError> {
        let handle = self.handle(id)?;
        let mut status = handle.status.lock();
        if *status != SessionStatus::Running {
            return Err(ControlError::NotRunning(id.to_string()));
        }
        handle.signals.pause();
        *status = SessionStatus::Paused;
        info!(session_id = %id, "Pause requested");
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), ControlError> {
        let handle = self.handle(id)?;
        let mut status = handle.status.lock();
        if *status != SessionStatus::Paused {
            return Err(ControlError::NotRunning(id.to_string()));
        }
        handle.signals.resume();
        *status = SessionStatus::Running;
        info!(session_id = %id, "Resume requested");
        Ok(())
    }

    /// Stop the session at the next step boundary; works while paused
    pub fn terminate(&self, id: &str) -> Result<(), ControlError> {
        let handle = self.handle(id)?;
        handle.signals.request_stop();
        info!(session_id = %id, "Termination requested");
        Ok(())
    }

    /// Queue a user instruction for the next decision
    pub fn intervene(&self, id: &str, message: &str) -> Result<(), ControlError> {
        let handle = self.handle(id)?;
        if !matches!(
            *handle.status.lock(),
            SessionStatus::Running | SessionStatus::Paused
        ) {
            return Err(ControlError::NotRunning(id.to_string()));
        }

        let was_paused = handle.signals.pause();
        handle.inbox.lock().push_back(message.to_string());
        let after_step = handle.signals.step();
        handle.emit(SessionEvent::Intervention {
            after_step,
            message: message.to_string(),
        });
        if !was_paused {
            handle.signals.resume();
        }
        info!(session_id = %id, after_step, "Intervention queued");
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<SessionStatus, ControlError> {
        Ok(*self.handle(id)?.status.lock())
    }

    pub fn list_active(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self
            .inner
            .active
            .iter()
            .map(|entry| SessionSummary {
                id: entry.key().clone(),
                status: *entry.status.lock(),
                unit_id: entry.unit_id.clone(),
                current_step: entry.signals.step(),
                started_at: entry.started_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}

/// Drain events until cleanup and return the final status
pub async fn wait_for_outcome(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionStatus {
    let mut outcome = SessionStatus::Error;
    while let Some(event) = events.recv().await {
        if let Some(status) = event.terminal_status() {
            outcome = status;
        }
        if matches!(event, SessionEvent::Cleanup) {
            break;
        }
    }
    outcome
}

/// Why the producer stopped
#[derive(Debug)]
enum LoopEnd {
    Finished,
    BudgetExhausted,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Setup,
    Teardown,
}

struct Supervisor {
    inner: Arc<Inner>,
    id: String,
    request: StartRequest,
    handle: SessionHandle,
    record: SessionRecord,
}

impl Supervisor {
    fn new(inner: Arc<Inner>, id: String, request: StartRequest, handle: SessionHandle) -> Self {
        let mut record = SessionRecord::new(id.clone(), request.prompt.clone());
        record.unit_id = request.unit_id.clone();
        record.user_id = request.user_id.clone();
        record.tenant_id = request.tenant_id.clone();
        Self {
            inner,
            id,
            request,
            handle,
            record,
        }
    }

    fn persist(&self) {
        if let Err(e) = self.inner.sessions.save_session(&self.record) {
            warn!(session_id = %self.id, error = %e, "Failed to persist session");
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        *self.handle.status.lock() = status;
        self.record.set_status(status);
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    async fn run(mut self) {
        self.handle.emit(SessionEvent::SessionCreated {
            session_id: self.id.clone(),
        });
        self.handle.emit(SessionEvent::Initializing);
        self.persist();

        let peer = match self.inner.provisioner.provision(&self.id).await {
            Ok(peer) => peer,
            Err(e) => {
                let err = SessionError::PeerProvisioning(format!("{:#}", e));
                error!(error = %err, "Session never started");
                self.record.error = Some(err.to_string());
                self.set_status(SessionStatus::Error);
                self.persist();
                self.handle.emit(SessionEvent::Error {
                    message: err.to_string(),
                });
                self.cleanup();
                return;
            }
        };
        info!(peer_id = %peer.id, "Peer ready");
        self.record.peer_id = Some(peer.id.clone());
        self.record.live_url = peer.live_url.clone();
        self.persist();
        self.handle.emit(SessionEvent::PeerReady {
            peer_id: peer.id.clone(),
            live_url: peer.live_url.clone(),
        });

        let mut agent = self.build_agent(&peer);

        let setup = self.replay_chain(agent.dispatcher(), Phase::Setup).await;
        if !setup.is_empty() {
            agent.add_message(ChatMessage::system(prompt::setup_context(&setup)));
            self.handle.emit(SessionEvent::SetupCompleted { units: setup });
        }
        agent.add_message(ChatMessage::user(self.request.prompt.clone()));

        self.set_status(SessionStatus::Running);
        self.persist();
        self.handle.emit(SessionEvent::Executing);

        let (end, announced) = self.drive(&mut agent).await;

        let status = match &end {
            _ if announced => SessionStatus::Terminated,
            Ok(LoopEnd::Stopped) => SessionStatus::Terminated,
            Ok(LoopEnd::Finished | LoopEnd::BudgetExhausted) => SessionStatus::Completed,
            Err(_) => SessionStatus::Error,
        };
        if status == SessionStatus::Completed {
            self.replay_chain(agent.dispatcher(), Phase::Teardown).await;
        }
        if let Err(e) = &end {
            self.record.error = Some(e.to_string());
        }

        self.finalize(&mut agent, &peer, status, announced).await;
    }

    fn build_agent(&self, peer: &PeerHandle) -> AgentLoop {
        let config = &self.inner.config;
        let channel = Arc::new(RpcChannel::new(peer.fs.clone(), config.channel.clone()));
        let browser: Arc<dyn Tool> = Arc::new(BrowserTool::new(channel));
        let plan = SharedPlan::default();

        let mut registry = ToolRegistry::new();
        registry.register_shared(browser.clone());
        registry.register(PlanningTool::new(plan.clone()));
        registry.register(TerminateTool);
        registry.register(DelegateTool::new(
            self.inner.provider.clone(),
            browser,
            config.agent.clone(),
            config.history,
        ));

        AgentLoop::new(
            self.inner.provider.clone(),
            Dispatcher::new(registry),
            AgentConfig::main(&config.agent, config.history),
        )
        .with_plan(plan)
        .with_session_id(self.id.clone())
    }

    /// Replay the proven steps of the unit's setup or teardown chain
    ///
    /// Failures are logged and skipped. Returns the units that passed.
    async fn replay_chain(&self, dispatcher: &Dispatcher, phase: Phase) -> Vec<String> {
        let (Some(units), Some(unit_id)) = (&self.inner.units, &self.request.unit_id) else {
            return Vec::new();
        };
        let chain = match resolve(&UnitGraph(units.as_ref()), unit_id) {
            Ok(chain) => chain,
            Err(e) => {
                warn!(unit_id = %unit_id, ?phase, error = %e, "Dependency chain skipped");
                return Vec::new();
            }
        };
        let ids = match phase {
            Phase::Setup => chain.before,
            Phase::Teardown => chain.after,
        };

        let ctx = ToolContext::new(self.id.clone());
        let mut passed = Vec::new();
        for id in ids {
            let unit = match units.load_unit(&id) {
                Ok(Some(unit)) => unit,
                Ok(None) => {
                    warn!(unit_id = %id, ?phase, "Dependency vanished before replay");
                    continue;
                }
                Err(e) => {
                    warn!(unit_id = %id, ?phase, error = %e, "Failed to load dependency");
                    continue;
                }
            };
            let report = replay(dispatcher, &unit.steps(), &ctx).await;
            if report.status == ReplayStatus::Passed {
                info!(unit_id = %id, ?phase, calls = report.passed, "Dependency replayed");
                passed.push(id);
            } else {
                warn!(unit_id = %id, ?phase, failed = report.failed, "Dependency replay failed");
            }
        }
        passed
    }

    /// Run producer and consumer to completion
    ///
    /// The flag is true when the consumer already announced termination.
    async fn drive(&self, agent: &mut AgentLoop) -> (Result<LoopEnd, SessionError>, bool) {
        let controller = &self.inner.config.controller;
        let (queue, rx) = mpsc::channel(controller.queue_capacity.max(1));
        let consumer = tokio::spawn(consume(
            rx,
            self.handle.clone(),
            controller.queue_poll(),
        ));

        let observer = QueueObserver {
            queue: queue.clone(),
            signals: self.handle.signals.clone(),
        };
        let budget = self
            .request
            .max_steps
            .unwrap_or(self.inner.config.agent.max_steps);
        let end = produce(
            agent,
            &observer,
            &self.handle,
            budget,
            controller.pause_poll(),
        )
        .await;

        let _ = queue.send(QueueItem::End).await;
        let announced = match consumer.await {
            Ok(announced) => announced,
            Err(e) => {
                warn!(error = %e, "Event consumer failed");
                false
            }
        };
        (end, announced)
    }

    async fn finalize(
        mut self,
        agent: &mut AgentLoop,
        peer: &PeerHandle,
        status: SessionStatus,
        announced: bool,
    ) {
        let proven = agent.finalize_proven_steps();
        self.record.set_proven_steps(&proven);
        self.record.history = agent.state().history.clone();
        self.record.current_step = agent.current_step();

        if let (Some(units), Some(unit_id)) = (&self.inner.units, &self.request.unit_id) {
            if !proven.is_empty() {
                if let Err(e) = units.save_proven_steps(unit_id, &proven) {
                    warn!(unit_id = %unit_id, error = %e, "Failed to save proven steps");
                }
            }
        }

        self.record.live_url = None;
        self.persist();
        if let Err(e) = self.inner.provisioner.release(peer).await {
            warn!(peer_id = %peer.id, error = %e, "Failed to release peer");
        }

        self.set_status(status);
        self.persist();
        info!(%status, steps = agent.current_step(), proven = proven.len(), "Session finished");

        match status {
            SessionStatus::Completed => self.handle.emit(SessionEvent::Completed {
                steps: agent.current_step(),
                proven_steps: proven.len(),
            }),
            SessionStatus::Terminated if !announced => self.handle.emit(SessionEvent::Terminated),
            SessionStatus::Error => self.handle.emit(SessionEvent::Error {
                message: self.record.error.clone().unwrap_or_default(),
            }),
            _ => {}
        }
        self.cleanup();
    }

    fn cleanup(&self) {
        self.inner.active.remove(&self.id);
        self.handle.emit(SessionEvent::Cleanup);
        debug!("Session removed");
    }
}

/// Step the agent until it finishes, runs out of budget or is stopped
async fn produce(
    agent: &mut AgentLoop,
    observer: &QueueObserver,
    handle: &SessionHandle,
    budget: u64,
    pause_poll: Duration,
) -> Result<LoopEnd, SessionError> {
    let signals = &handle.signals;
    loop {
        if agent.is_finished() {
            return Ok(LoopEnd::Finished);
        }
        if agent.current_step() >= budget {
            info!(budget, "Step budget exhausted");
            return Ok(LoopEnd::BudgetExhausted);
        }
        while signals.paused() && !signals.stopped() {
            sleep(pause_poll).await;
        }
        if signals.stopped() {
            return Ok(LoopEnd::Stopped);
        }

        let pending: Vec<String> = handle.inbox.lock().drain(..).collect();
        for message in pending {
            agent.inject_intervention(&prompt::intervention(&message), &message);
        }

        agent.step(observer).await?;
    }
}

/// Forward queued events, watching the control flags between deliveries
///
/// Returns true if it announced termination.
async fn consume(
    mut queue: mpsc::Receiver<QueueItem>,
    handle: SessionHandle,
    poll: Duration,
) -> bool {
    let mut paused = false;
    loop {
        if handle.signals.stopped() {
            info!("Stop observed");
            handle.emit(SessionEvent::Terminated);
            return true;
        }
        let now_paused = handle.signals.paused();
        if now_paused != paused {
            paused = now_paused;
            handle.emit(if paused {
                SessionEvent::Paused
            } else {
                SessionEvent::Resumed
            });
        }

        match timeout(poll, queue.recv()).await {
            Ok(Some(QueueItem::Event(event))) => handle.emit(event),
            Ok(Some(QueueItem::End)) | Ok(None) => return false,
            Err(_) => {}
        }
    }
}

/// Pushes step progress into the session queue
struct QueueObserver {
    queue: mpsc::Sender<QueueItem>,
    signals: Arc<ControlSignals>,
}

impl QueueObserver {
    async fn push(&self, event: SessionEvent) {
        if self.queue.send(QueueItem::Event(event)).await.is_err() {
            debug!("Event queue closed");
        }
    }
}

#[async_trait]
impl StepObserver for QueueObserver {
    async fn step_started(&self, step: u64, calls: &[ToolCall]) {
        self.signals.set_step(step);
        let tools = calls
            .iter()
            .map(|call| PlannedCall {
                name: call.name.clone(),
                arguments: serde_json::from_str(&call.arguments)
                    .unwrap_or_else(|_| Value::String(call.arguments.clone())),
            })
            .collect();
        self.push(SessionEvent::StepStart { step, tools }).await;
    }

    async fn step_completed(&self, record: &StepRecord) {
        self.signals.set_step(record.step);
        self.push(SessionEvent::StepComplete {
            record: record.clone(),
        })
        .await;
    }
}
