//! Throwaway containers that serve a submitted snapshot on the internal network.

mod docker;

pub use docker::DockerCli;

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::TargetConfig;
use crate::task::SnapshotFile;

// Snapshot directories must be readable by the unprivileged container user
const SNAPSHOT_DIR_PERMISSIONS: u32 = 0o755;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("snapshot path {0:?} is not a safe relative path")]
    InvalidPath(String),
    #[error("snapshot file {path:?} is not valid base64: {source}")]
    InvalidBase64 {
        path: String,
        source: base64::DecodeError,
    },
    #[error("failed to materialise snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("container runtime error: {0}")]
    Runtime(String),
    #[error("target {alias} did not become ready within {timeout:?}")]
    StartTimeout { alias: String, timeout: Duration },
    #[error("target {alias} exited before becoming ready")]
    ExitedEarly { alias: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub network: String,
    pub alias: String,
    pub mount_source: PathBuf,
    pub mount_target: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
}

/// The container engine the orchestrator drives
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn network_exists(&self, name: &str) -> anyhow::Result<bool>;

    /// Creates a network without external connectivity
    async fn create_network(&self, name: &str) -> anyhow::Result<()>;

    async fn remove_network(&self, name: &str) -> anyhow::Result<()>;

    /// Starts a container and streams its standard output line by line
    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<mpsc::Receiver<String>>;

    /// Stops (and thereby removes) a container; stopping a missing one succeeds
    async fn stop(&self, name: &str) -> anyhow::Result<()>;

    /// Force-removes a container; removing a missing one succeeds
    async fn remove(&self, name: &str) -> anyhow::Result<()>;
}

/// Creates and destroys ephemeral targets.
pub struct TargetOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    config: TargetConfig,
}

impl TargetOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: TargetConfig) -> Self {
        Self { runtime, config }
    }

    /// Creates the shared internal network unless it already exists
    pub async fn init(&self) -> anyhow::Result<()> {
        let network = &self.config.network;
        if self.runtime.network_exists(network).await? {
            log::info!("Using existing internal network {network}");
        } else {
            self.runtime.create_network(network).await?;
            log::info!("Created internal network {network}");
        }
        Ok(())
    }

    /// Removes the shared network; only for full system teardown
    pub async fn teardown(&self) -> anyhow::Result<()> {
        self.runtime.remove_network(&self.config.network).await?;
        log::info!("Removed internal network {}", self.config.network);
        Ok(())
    }

    /// Serves `snapshot` from a fresh container and waits until it reports ready
    pub async fn start(
        &self,
        record_id: i64,
        snapshot: &BTreeMap<String, SnapshotFile>,
    ) -> Result<EphemeralTarget, TargetError> {
        let alias = network_alias(record_id, snapshot);
        let work_dir = self.config.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        let dir = materialize(&work_dir, snapshot).await?;

        let spec = ContainerSpec {
            name: alias.clone(),
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            network: self.config.network.clone(),
            alias: alias.clone(),
            mount_source: dir.path().to_path_buf(),
            mount_target: self.config.mount_path.clone(),
            memory: self.config.memory.clone(),
            cpus: self.config.cpus.clone(),
            pids_limit: self.config.pids_limit,
        };
        let target = EphemeralTarget {
            network_url: format!("http://{alias}:{}", self.config.port),
            alias: alias.clone(),
            runtime: Arc::clone(&self.runtime),
            dir: Mutex::new(Some(dir)),
            closed: AtomicBool::new(false),
        };

        // A redelivered job reuses the name of a container a crash left behind
        if let Err(e) = self.runtime.remove(&spec.name).await {
            log::warn!("Failed to clear leftover container {}: {e:#}", spec.name);
        }

        let mut lines = match self.runtime.start(&spec).await {
            Ok(lines) => lines,
            Err(e) => {
                target.close().await;
                return Err(TargetError::Runtime(format!("{e:#}")));
            }
        };

        let timeout: Duration = self.config.start_timeout.into();
        let marker = self.config.ready_marker.as_str();
        match tokio::time::timeout(timeout, wait_for_marker(&mut lines, marker)).await {
            Ok(true) => {
                log::debug!("Target {alias} is ready at {}", target.network_url);
                Ok(target)
            }
            Ok(false) => {
                target.close().await;
                Err(TargetError::ExitedEarly { alias })
            }
            Err(_) => {
                log::warn!("Target {alias} missed its {timeout:?} start deadline");
                target.close().await;
                Err(TargetError::StartTimeout { alias, timeout })
            }
        }
    }
}

async fn wait_for_marker(lines: &mut mpsc::Receiver<String>, marker: &str) -> bool {
    while let Some(line) = lines.recv().await {
        log::trace!("target: {line}");
        if line.contains(marker) {
            return true;
        }
    }
    false
}

/// A running target; torn down exactly once by [`EphemeralTarget::close`] or on drop.
pub struct EphemeralTarget {
    network_url: String,
    alias: String,
    runtime: Arc<dyn ContainerRuntime>,
    dir: Mutex<Option<TempDir>>,
    closed: AtomicBool,
}

impl EphemeralTarget {
    /// URL reachable from inside the internal network
    pub fn network_url(&self) -> &str {
        &self.network_url
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Stops the container and removes the snapshot directory
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.runtime.stop(&self.alias).await {
            log::error!("Failed to stop target {}: {e:#}", self.alias);
        }
        remove_dir(self.dir.lock().take());
        log::debug!("Target {} closed", self.alias);
    }
}

impl Drop for EphemeralTarget {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::warn!("Target {} dropped without close, cleaning up", self.alias);
        let dir = self.dir.lock().take();
        let runtime = Arc::clone(&self.runtime);
        let alias = self.alias.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.stop(&alias).await {
                        log::error!("Failed to stop target {alias}: {e:#}");
                    }
                    remove_dir(dir);
                });
            }
            Err(_) => remove_dir(dir),
        }
    }
}

fn remove_dir(dir: Option<TempDir>) {
    if let Some(dir) = dir {
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            log::warn!("Failed to remove snapshot directory {}: {e}", path.display());
        }
    }
}

/// Alias unique to this record and snapshot content
pub fn network_alias(record_id: i64, snapshot: &BTreeMap<String, SnapshotFile>) -> String {
    let mut hasher = Sha256::new();
    for (path, file) in snapshot {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        match file {
            SnapshotFile::Text(text) => {
                hasher.update([b't']);
                hasher.update(text.as_bytes());
            }
            SnapshotFile::Binary { base64 } => {
                hasher.update([b'b']);
                hasher.update(base64.as_bytes());
            }
        }
        hasher.update([0]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("target-{record_id}-{}", &digest[..12])
}

/// Accepts `a/b`, `/a/b` and `./a/b`; rejects anything escaping the root
pub fn safe_relative_path(path: &str) -> Result<PathBuf, TargetError> {
    let mut relative = PathBuf::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(TargetError::InvalidPath(path.to_string())),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(TargetError::InvalidPath(path.to_string()));
    }
    Ok(relative)
}

async fn materialize(
    base: &Path,
    snapshot: &BTreeMap<String, SnapshotFile>,
) -> Result<TempDir, TargetError> {
    tokio::fs::create_dir_all(base).await?;
    let dir = tempfile::Builder::new().prefix("webjudge-").tempdir_in(base)?;
    std::fs::set_permissions(
        dir.path(),
        std::fs::Permissions::from_mode(SNAPSHOT_DIR_PERMISSIONS),
    )?;

    for (path, file) in snapshot {
        let dest = dir.path().join(safe_relative_path(path)?);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = match file {
            SnapshotFile::Text(text) => text.as_bytes().to_vec(),
            SnapshotFile::Binary { base64 } => {
                STANDARD
                    .decode(base64)
                    .map_err(|source| TargetError::InvalidBase64 {
                        path: path.clone(),
                        source,
                    })?
            }
        };
        tokio::fs::write(&dest, bytes).await?;
    }

    Ok(dir)
}
