//! Test doubles shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use llm_core::{ChatMessage, ChatProvider, ChatRequest, ChatResponse, LlmError, ToolCall};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::ChannelConfig;
use crate::rpc::peer::last_lines;
use crate::rpc::{Command, PeerFs, PeerHandle, PeerProvisioner};

static CALL_IDS: AtomicUsize = AtomicUsize::new(0);

/// Tool call with a fresh id
pub(crate) fn call(name: &str, args: Value) -> ToolCall {
    let n = CALL_IDS.fetch_add(1, Ordering::Relaxed);
    ToolCall::new(format!("call_{}", n), name, args.to_string())
}

/// Decision that calls a single tool
pub(crate) fn decide(name: &str, args: Value) -> ChatResponse {
    ChatResponse::with_calls("", vec![call(name, args)])
}

/// What the fake peer does with a command
pub(crate) enum PeerReply {
    Json(Value),
    Raw(String),
    Silent,
}

type Responder = Box<dyn Fn(&Command) -> PeerReply + Send + Sync>;

/// In-memory peer that answers commands synchronously
pub(crate) struct MemoryPeer {
    files: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<Command>>,
    responder: Responder,
    partial_reads: AtomicUsize,
    reads: AtomicUsize,
    paths: ChannelConfig,
}

impl MemoryPeer {
    pub(crate) fn new(responder: impl Fn(&Command) -> PeerReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            partial_reads: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            paths: ChannelConfig::default(),
        })
    }

    /// Succeeds every command with `"<action> ok"`
    pub(crate) fn echo() -> Arc<Self> {
        Self::new(|cmd| PeerReply::Json(json!({"success": true, "message": format!("{} ok", cmd.action)})))
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub(crate) fn command_count(&self) -> usize {
        self.commands.lock().len()
    }

    pub(crate) fn set_partial_reads(&self, n: usize) {
        self.partial_reads.store(n, Ordering::SeqCst);
    }

    pub(crate) fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn set_log(&self, content: &str) {
        self.put_file(&self.paths.log_path.clone(), content);
    }

    pub(crate) fn put_file(&self, path: &str, content: &str) {
        self.files.lock().insert(path.to_string(), content.to_string());
    }

    pub(crate) fn has_file(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }
}

#[async_trait]
impl PeerFs for MemoryPeer {
    async fn write(&self, path: &str, content: &str) -> Result<()> {
        self.put_file(path, content);
        if path != self.paths.command_path {
            return Ok(());
        }

        let command: Command = serde_json::from_str(content)?;
        let reply = (self.responder)(&command);
        self.commands.lock().push(command);
        match reply {
            PeerReply::Json(value) => self.put_file(&self.paths.response_path, &value.to_string()),
            PeerReply::Raw(raw) => self.put_file(&self.paths.response_path, &raw),
            PeerReply::Silent => {}
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.has_file(path))
    }

    async fn read(&self, path: &str) -> Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let pending = self.partial_reads.load(Ordering::SeqCst);
        if pending > 0 {
            self.partial_reads.store(pending - 1, Ordering::SeqCst);
            return Ok(String::new());
        }
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", path))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    async fn tail(&self, path: &str, lines: usize) -> Result<String> {
        Ok(self
            .files
            .lock()
            .get(path)
            .map(|content| last_lines(content, lines))
            .unwrap_or_default())
    }
}

/// Provisioner handing out one shared [`MemoryPeer`]
pub(crate) struct MemoryProvisioner {
    pub(crate) peer: Arc<MemoryPeer>,
    pub(crate) fail: bool,
    pub(crate) released: AtomicUsize,
}

impl MemoryProvisioner {
    pub(crate) fn new(peer: Arc<MemoryPeer>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            fail: false,
            released: AtomicUsize::new(0),
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            peer: MemoryPeer::echo(),
            fail: true,
            released: AtomicUsize::new(0),
        })
    }

    pub(crate) fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerProvisioner for MemoryProvisioner {
    async fn provision(&self, session_id: &str) -> Result<PeerHandle> {
        if self.fail {
            return Err(anyhow!("sandbox quota exhausted"));
        }
        Ok(PeerHandle {
            id: format!("mem-{}", session_id),
            fs: self.peer.clone(),
            live_url: Some(format!("http://live/{}", session_id)),
        })
    }

    async fn release(&self, _peer: &PeerHandle) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Request as seen by the scripted provider
#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) tools: Vec<String>,
}

/// Provider replaying a fixed script of decisions
pub(crate) struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    fallback: Mutex<Option<ChatResponse>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new(script: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            fallback: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Decision returned once the script runs out
    pub(crate) fn with_fallback(self: Arc<Self>, fallback: ChatResponse) -> Arc<Self> {
        *self.fallback.lock() = Some(fallback);
        self
    }

    pub(crate) fn push_err(&self, err: LlmError) {
        self.script.lock().push_back(Err(err));
    }

    pub(crate) fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
        self.seen.lock().push(SeenRequest {
            messages: request.messages.to_vec(),
            tools: request.tools.iter().map(|t| t.function.name.clone()).collect(),
        });

        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        let fallback = self.fallback.lock().clone();
        Ok(fallback.unwrap_or_else(|| ChatResponse::text("nothing left to do")))
    }
}
