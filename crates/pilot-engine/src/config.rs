//! Engine configuration
//!
//! Configuration file: `pilot.toml` in the current directory or a parent,
//! otherwise `~/.config/pilot/config.toml` (or platform equivalent).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use llm_core::LlmConfig;
use serde::{Deserialize, Serialize};

/// Local configuration file name searched for in the working tree
pub const CONFIG_FILE_NAME: &str = "pilot.toml";

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Agent loop limits and prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Step budget enforced by the session controller
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Observations longer than this are truncated (delegate results exempt)
    #[serde(default = "default_max_observe")]
    pub max_observe: usize,

    /// Default step budget for a delegated sub-task
    #[serde(default = "default_delegate_max_steps")]
    pub delegate_max_steps: u64,

    /// Overrides the built-in system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Overrides the built-in per-step prompt
    #[serde(default)]
    pub next_step_prompt: Option<String>,
}

/// Conversation truncation thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Truncate once the conversation grows beyond this many messages
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Preferred number of trailing messages to keep
    #[serde(default = "default_preferred_keep")]
    pub preferred_keep: usize,

    /// Suffix kept when no clean turn boundary exists
    #[serde(default = "default_fallback_keep")]
    pub fallback_keep: usize,
}

/// RPC channel artifacts and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_command_path")]
    pub command_path: String,

    #[serde(default = "default_response_path")]
    pub response_path: String,

    #[serde(default = "default_log_path")]
    pub log_path: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay between writing a command and the first poll
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Peer log lines attached to channel errors
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

/// Session controller queue and polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the consumer waits on the queue before re-checking signals
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,

    /// How often a paused producer re-checks its signals
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

/// Local peer provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Root under which each session gets its own peer directory
    #[serde(default = "default_peer_root")]
    pub root: PathBuf,

    /// Live-view URL template; `{session}` is replaced with the session id
    #[serde(default)]
    pub live_url_template: Option<String>,
}

/// JSON store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

fn default_max_steps() -> u64 {
    20
}

fn default_max_observe() -> usize {
    10_000
}

fn default_delegate_max_steps() -> u64 {
    100
}

fn default_max_messages() -> usize {
    80
}

fn default_preferred_keep() -> usize {
    50
}

fn default_fallback_keep() -> usize {
    30
}

fn default_command_path() -> String {
    "/tmp/browser_command.json".to_string()
}

fn default_response_path() -> String {
    "/tmp/browser_response.json".to_string()
}

fn default_log_path() -> String {
    "/tmp/browser.log".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_settle_ms() -> u64 {
    100
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_log_tail_lines() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    100
}

fn default_queue_poll_ms() -> u64 {
    1000
}

fn default_pause_poll_ms() -> u64 {
    1000
}

fn default_peer_root() -> PathBuf {
    std::env::temp_dir().join("pilot-peers")
}

fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pilot")
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_observe: default_max_observe(),
            delegate_max_steps: default_delegate_max_steps(),
            system_prompt: None,
            next_step_prompt: None,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            preferred_keep: default_preferred_keep(),
            fallback_keep: default_fallback_keep(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_path: default_command_path(),
            response_path: default_response_path(),
            log_path: default_log_path(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            timeout_secs: default_timeout_secs(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            queue_poll_ms: default_queue_poll_ms(),
            pause_poll_ms: default_pause_poll_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            root: default_peer_root(),
            live_url_template: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

impl EngineConfig {
    /// Load from `pilot.toml` in the working tree, then the user config dir,
    /// falling back to defaults when neither exists
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::find_local_config()? {
            return Self::load_from(path);
        }

        let user_path = Self::config_path()?;
        if user_path.exists() {
            return Self::load_from(user_path);
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Search the current directory and its parents for `pilot.toml`
    pub fn find_local_config() -> Result<Option<PathBuf>> {
        let mut current = std::env::current_dir()?;

        for _ in 0..10 {
            let candidate = current.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                return Ok(Some(candidate));
            }
            if !current.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Get the user configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("pilot").join("config.toml"))
    }

    /// Write a commented default configuration file
    pub fn create_default(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

const DEFAULT_CONFIG: &str = r#"# pilot configuration

[llm]
model = "gpt-4o"
base_url = "https://api.openai.com/v1"
# api_key = ""            # or set PILOT_API_KEY
max_tokens = 4096
# max_input_tokens = 2000000
temperature = 1.0

[agent]
# Steps a session may take before it is wound down
max_steps = 20
# Longest observation fed back to the model
max_observe = 10000
# Default budget for delegated sub-tasks
delegate_max_steps = 100

[history]
max_messages = 80
preferred_keep = 50
fallback_keep = 30

[channel]
command_path = "/tmp/browser_command.json"
response_path = "/tmp/browser_response.json"
log_path = "/tmp/browser.log"
poll_interval_ms = 500
settle_ms = 100
timeout_secs = 60
log_tail_lines = 100

[controller]
queue_capacity = 100
queue_poll_ms = 1000
pause_poll_ms = 1000

[peer]
# root = "/tmp/pilot-peers"
# live_url_template = "http://localhost:6080/vnc.html?session={session}"

[store]
# dir = "~/.local/share/pilot"
"#;
