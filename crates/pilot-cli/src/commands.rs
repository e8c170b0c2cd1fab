//! Command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use llm_core::HttpChatClient;
use pilot_engine::batch::{BatchMode, BatchRunner};
use pilot_engine::config::CONFIG_FILE_NAME;
use pilot_engine::deps::resolve as resolve_chain;
use pilot_engine::replay::{replay as replay_steps, ReplayStatus};
use pilot_engine::rpc::{LocalProvisioner, PeerProvisioner, RpcChannel};
use pilot_engine::store::{JsonStore, UnitGraph, UnitStore};
use pilot_engine::tools::builtin::BrowserTool;
use pilot_engine::tools::dispatcher::Dispatcher;
use pilot_engine::tools::registry::ToolRegistry;
use pilot_engine::tools::ToolContext;
use pilot_engine::{EngineConfig, SessionController, SessionEvent, SessionStatus, StartRequest};
use tracing::warn;

/// Everything a command needs, built from the effective config
struct Engine {
    config: EngineConfig,
    store: Arc<JsonStore>,
}

impl Engine {
    fn load() -> Result<Self> {
        let config = EngineConfig::load().context("Failed to load pilot.toml")?;
        let store = Arc::new(JsonStore::open(&config.store.dir)?);
        Ok(Self { config, store })
    }

    fn provisioner(&self) -> LocalProvisioner {
        LocalProvisioner::new(&self.config.peer.root)
            .with_live_url_template(self.config.peer.live_url_template.clone())
    }

    fn controller(&self) -> Result<SessionController> {
        let provider = HttpChatClient::new(self.config.llm.clone())
            .context("Failed to create LLM client")?;
        Ok(SessionController::new(
            self.config.clone(),
            Arc::new(provider),
            Arc::new(self.provisioner()),
            self.store.clone(),
            Some(self.store.clone()),
        ))
    }
}

/// Options of `pilot run`
pub struct RunOptions {
    pub unit: Option<String>,
    pub user: Option<String>,
    pub tenant: Option<String>,
    pub max_steps: Option<u64>,
    pub json: bool,
}

/// Build the start request for `pilot run`
pub fn start_request(prompt: &str, options: &RunOptions) -> StartRequest {
    let mut request = StartRequest::new(prompt);
    if let Some(unit) = &options.unit {
        request = request.with_unit(unit.as_str());
    }
    if let Some(user) = &options.user {
        request = request.with_user(user.as_str());
    }
    if let Some(tenant) = &options.tenant {
        request = request.with_tenant(tenant.as_str());
    }
    if let Some(max_steps) = options.max_steps {
        request = request.with_max_steps(max_steps);
    }
    request
}

pub async fn run(prompt: &str, options: RunOptions) -> Result<()> {
    if prompt.trim().is_empty() {
        bail!("A prompt is required");
    }
    let engine = Engine::load()?;
    let controller = engine.controller()?;

    let json = options.json;
    let (session_id, mut events) = controller.start(start_request(prompt, &options));
    let mut outcome = SessionStatus::Error;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(status) = event.terminal_status() {
                    outcome = status;
                }
                print_event(&event, json)?;
                if matches!(event, SessionEvent::Cleanup) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Interrupted, terminating session {}", session_id);
                if let Err(e) = controller.terminate(&session_id) {
                    warn!(error = %e, "Terminate failed");
                }
            }
        }
    }

    if outcome == SessionStatus::Error {
        bail!("Session {} ended with an error", session_id);
    }
    Ok(())
}

fn print_event(event: &SessionEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        SessionEvent::SessionCreated { session_id } => println!("Session {}", session_id),
        SessionEvent::PeerReady { peer_id, live_url } => match live_url {
            Some(url) => println!("Peer {} ready, live view: {}", peer_id, url),
            None => println!("Peer {} ready", peer_id),
        },
        SessionEvent::SetupCompleted { units } => println!("Setup replayed: {}", units.join(", ")),
        SessionEvent::StepStart { step, tools } => {
            let names: Vec<String> = tools
                .iter()
                .map(|t| match t.arguments["action"].as_str() {
                    Some(action) => format!("{}({})", t.name, action),
                    None => t.name.clone(),
                })
                .collect();
            println!("\n[step {}] {}", step, names.join(", "));
        }
        SessionEvent::StepComplete { record } => {
            if record.tool_calls.is_empty() && !record.thinking.is_empty() {
                println!("\n[step {}] {}", record.step, record.thinking);
            }
            for call in &record.tool_calls {
                let mark = if call.success { "ok" } else { "FAILED" };
                let first_line = call.result_preview.lines().next().unwrap_or_default();
                println!("  {} {}: {}", mark, call.tool, first_line);
            }
        }
        SessionEvent::Paused => println!("Paused"),
        SessionEvent::Resumed => println!("Resumed"),
        SessionEvent::Intervention { message, .. } => println!("Intervention: {}", message),
        SessionEvent::Terminated => println!("\nTerminated"),
        SessionEvent::Completed { steps, proven_steps } => {
            println!("\nCompleted after {} steps ({} proven steps)", steps, proven_steps)
        }
        SessionEvent::Error { message } => eprintln!("\nError: {}", message),
        SessionEvent::Initializing | SessionEvent::Executing | SessionEvent::Cleanup => {}
    }
    Ok(())
}

pub fn resolve(unit: &str) -> Result<()> {
    let engine = Engine::load()?;
    let chain = resolve_chain(&UnitGraph(engine.store.as_ref()), unit)?;

    println!("Before: {}", display_list(&chain.before));
    println!("After:  {}", display_list(&chain.after));
    Ok(())
}

fn display_list(ids: &[String]) -> String {
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(" -> ")
    }
}

pub async fn replay(unit_id: &str, json: bool) -> Result<()> {
    let engine = Engine::load()?;
    let unit = engine
        .store
        .load_unit(unit_id)?
        .with_context(|| format!("Unit not found: {}", unit_id))?;
    let steps = unit.steps();
    if steps.is_empty() {
        bail!("Unit {} has no proven steps", unit_id);
    }

    let session_id = format!("replay-{}", unit_id);
    let provisioner = engine.provisioner();
    let peer = provisioner.provision(&session_id).await?;

    let channel = Arc::new(RpcChannel::new(peer.fs.clone(), engine.config.channel.clone()));
    let mut registry = ToolRegistry::new();
    registry.register(BrowserTool::new(channel));
    let report = replay_steps(
        &Dispatcher::new(registry),
        &steps,
        &ToolContext::new(session_id.clone()),
    )
    .await;

    if let Err(e) = provisioner.release(&peer).await {
        warn!(error = %e, "Failed to release peer");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for call in &report.results {
            let mark = if call.success { "ok" } else { "FAILED" };
            println!(
                "  [{}] {} {}",
                call.step_index,
                mark,
                call.action.as_deref().unwrap_or(&call.tool_name)
            );
        }
        println!("\n{} passed, {} failed", report.passed, report.failed);
    }

    if report.status == ReplayStatus::Failed {
        bail!("Replay of {} failed", unit_id);
    }
    Ok(())
}

pub async fn batch(units: Vec<String>, parallel: bool, run_id: Option<String>) -> Result<()> {
    let engine = Engine::load()?;
    let runner = BatchRunner::new(engine.controller()?, engine.store.clone(), engine.store.clone());

    let run_id = run_id.unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4()));
    let mode = if parallel {
        BatchMode::Parallel
    } else {
        BatchMode::Sequential
    };
    println!("Run {} ({} units, {:?})", run_id, units.len(), mode);

    let run = runner.execute(&run_id, &units, mode).await?;
    for (unit, result) in &run.units {
        println!(
            "  {:<24} {:<12} {}",
            unit,
            result.status.as_str(),
            result.session_id.as_deref().unwrap_or("-")
        );
    }

    let failed = run
        .units
        .values()
        .filter(|r| r.status != SessionStatus::Completed)
        .count();
    if failed > 0 {
        bail!("{} of {} units did not complete", failed, run.units.len());
    }
    Ok(())
}

pub fn config_init(local: bool) -> Result<()> {
    let path = if local {
        PathBuf::from(CONFIG_FILE_NAME)
    } else {
        EngineConfig::config_path()?
    };
    EngineConfig::create_default(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

pub fn config_show() -> Result<()> {
    let mut config = EngineConfig::load()?;
    if !config.llm.api_key.is_empty() {
        config.llm.api_key = "<redacted>".to_string();
    }
    println!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
    Ok(())
}
