//! Remote automation peer access
//!
//! The peer exposes no RPC surface of its own; all the engine can do is read
//! and write files in its environment. [`PeerFs`] is that surface, and
//! [`PeerProvisioner`] hands out and reclaims peers.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// File-system view of a remote peer
#[async_trait]
pub trait PeerFs: Send + Sync {
    /// Replace the file's content atomically
    async fn write(&self, path: &str, content: &str) -> Result<()>;

    /// Check whether a file exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read a file's full content
    async fn read(&self, path: &str) -> Result<String>;

    /// Remove a file; a missing file is not an error
    async fn remove(&self, path: &str) -> Result<()>;

    /// Last `lines` lines of a text file, empty if it does not exist
    async fn tail(&self, path: &str, lines: usize) -> Result<String>;
}

/// A provisioned peer owned by one session
#[derive(Clone)]
pub struct PeerHandle {
    pub id: String,
    pub fs: Arc<dyn PeerFs>,
    /// Live view of the peer's browser, if the provisioner offers one
    pub live_url: Option<String>,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("live_url", &self.live_url)
            .finish()
    }
}

/// Creates and releases peers
#[async_trait]
pub trait PeerProvisioner: Send + Sync {
    async fn provision(&self, session_id: &str) -> Result<PeerHandle>;

    async fn release(&self, peer: &PeerHandle) -> Result<()>;
}

/// Peer whose file system is a local directory (shared volume or co-located peer)
#[derive(Debug, Clone)]
pub struct LocalPeerFs {
    root: PathBuf,
}

impl LocalPeerFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a peer path such as `/tmp/browser_command.json` under the root
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl PeerFs for LocalPeerFs {
    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let staging = target.with_extension("partial");
        tokio::fs::write(&staging, content)
            .await
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &target)
            .await
            .with_context(|| format!("Failed to move command into {}", target.display()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .with_context(|| format!("Failed to stat {}", path))
    }

    async fn read(&self, path: &str) -> Result<String> {
        tokio::fs::read_to_string(self.resolve(path))
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path)),
        }
    }

    async fn tail(&self, path: &str, lines: usize) -> Result<String> {
        let content = match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path)),
        };
        Ok(last_lines(&content, lines))
    }
}

pub(crate) fn last_lines(content: &str, lines: usize) -> String {
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Provisions one [`LocalPeerFs`] directory per session
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    root: PathBuf,
    live_url_template: Option<String>,
}

impl LocalProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            live_url_template: None,
        }
    }

    pub fn with_live_url_template(mut self, template: Option<String>) -> Self {
        self.live_url_template = template;
        self
    }

    fn peer_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PeerProvisioner for LocalProvisioner {
    async fn provision(&self, session_id: &str) -> Result<PeerHandle> {
        let dir = self.peer_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create peer directory {}", dir.display()))?;

        info!(session_id, peer_dir = %dir.display(), "Provisioned local peer");
        Ok(PeerHandle {
            id: format!("local-{}", session_id),
            fs: Arc::new(LocalPeerFs::new(dir)),
            live_url: self
                .live_url_template
                .as_ref()
                .map(|template| template.replace("{session}", session_id)),
        })
    }

    async fn release(&self, peer: &PeerHandle) -> Result<()> {
        let session_id = peer.id.trim_start_matches("local-");
        let dir = self.peer_dir(session_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", dir.display()))
            }
        }
        debug!(peer_id = %peer.id, "Released local peer");
        Ok(())
    }
}
