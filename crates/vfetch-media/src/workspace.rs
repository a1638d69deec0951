//! Per-job scratch directories.
//!
//! The manager owns a root directory and a quota counter shared by every job.
//! `allocate` reserves the per-job quota and creates a fresh directory;
//! `release` deletes it and returns the reservation. Release is idempotent and
//! never fails the caller: errors are logged and the periodic `sweep` picks up
//! whatever was left behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};
use vfetch_models::JobId;

use crate::error::{MediaError, MediaResult};

/// Directory name prefix for job workspaces. Sweeps only touch these.
pub const WORKSPACE_PREFIX: &str = "job-";

const WRITE_PROBE: &str = ".write-probe";

/// Workspace manager configuration.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Root directory holding every workspace
    pub root: PathBuf,
    /// Bytes reserved for (and allowed to) each job
    pub job_quota_bytes: u64,
    /// Sum of reservations allowed at once
    pub total_quota_bytes: u64,
    /// Maximum number of live workspaces
    pub max_workspaces: usize,
    /// Free space that must remain on the filesystem after reserving a job
    pub min_free_bytes: u64,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            job_quota_bytes: 2 * 1024 * 1024 * 1024,
            total_quota_bytes: 8 * 1024 * 1024 * 1024,
            max_workspaces: 16,
            min_free_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Counters exposed for readiness and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceStats {
    pub live: usize,
    pub reserved_bytes: u64,
    pub allocated_total: u64,
    pub released_total: u64,
}

#[derive(Debug, Default)]
struct QuotaState {
    /// Live workspace path -> reserved bytes
    live: HashMap<PathBuf, u64>,
    allocated_total: u64,
    released_total: u64,
}

impl QuotaState {
    fn reserved(&self) -> u64 {
        self.live.values().sum()
    }
}

#[derive(Debug)]
struct Inner {
    config: WorkspaceConfig,
    state: Mutex<QuotaState>,
}

/// Allocates and reclaims job workspaces under one root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    inner: Arc<Inner>,
}

impl WorkspaceManager {
    /// Create the root (if needed) and verify it is writable.
    pub async fn new(config: WorkspaceConfig) -> MediaResult<Self> {
        fs::create_dir_all(&config.root).await.map_err(|e| {
            MediaError::internal(format!(
                "cannot create workspace root {}: {}",
                config.root.display(),
                e
            ))
        })?;

        let probe = config.root.join(WRITE_PROBE);
        fs::write(&probe, b"ok").await.map_err(|e| {
            MediaError::internal(format!(
                "workspace root {} is not writable: {}",
                config.root.display(),
                e
            ))
        })?;
        let _ = fs::remove_file(&probe).await;

        info!(
            root = %config.root.display(),
            job_quota_bytes = config.job_quota_bytes,
            max_workspaces = config.max_workspaces,
            "Workspace manager ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QuotaState::default()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, QuotaState> {
        // Critical sections never panic mid-update, so a poisoned lock is still consistent.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve quota and create a uniquely named directory for `job_id`.
    pub async fn allocate(&self, job_id: &JobId) -> MediaResult<Workspace> {
        let config = &self.inner.config;
        let path = config.root.join(format!("{WORKSPACE_PREFIX}{job_id}"));

        {
            let mut state = self.state();
            if state.live.len() >= config.max_workspaces {
                return Err(MediaError::resource_exhausted(format!(
                    "workspace limit reached ({} live)",
                    state.live.len()
                )));
            }
            let reserved = state.reserved();
            if reserved.saturating_add(config.job_quota_bytes) > config.total_quota_bytes {
                return Err(MediaError::resource_exhausted(format!(
                    "disk quota exhausted ({} of {} bytes reserved)",
                    reserved, config.total_quota_bytes
                )));
            }
            if state.live.contains_key(&path) {
                return Err(MediaError::internal(format!(
                    "workspace {} is already in use",
                    path.display()
                )));
            }
            state.live.insert(path.clone(), config.job_quota_bytes);
        }

        if let Err(e) = self.check_free_space() {
            self.unreserve(&path);
            return Err(e);
        }

        if let Err(e) = fs::create_dir(&path).await {
            self.unreserve(&path);
            return Err(match e.kind() {
                std::io::ErrorKind::AlreadyExists => MediaError::internal(format!(
                    "workspace {} already exists on disk",
                    path.display()
                )),
                _ => MediaError::Io(e),
            });
        }

        let live = {
            let mut state = self.state();
            state.allocated_total += 1;
            state.live.len()
        };
        gauge!("vfetch_workspaces_live").set(live as f64);
        debug!(job_id = %job_id, path = %path.display(), "Allocated workspace");

        Ok(Workspace {
            path,
            job_id: job_id.clone(),
            quota_bytes: config.job_quota_bytes,
            manager: self.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Delete a workspace directory and return its reservation.
    ///
    /// Safe to call twice and safe if the directory was already removed.
    /// Returns `true` when the directory is gone afterwards.
    pub async fn release(&self, path: &Path) -> bool {
        if !self.owns(path) {
            warn!(path = %path.display(), "Refusing to release a path outside the workspace root");
            return false;
        }
        self.unreserve(path);

        match fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Released workspace");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %path.display(), "Failed to delete workspace: {}", e);
                false
            }
        }
    }

    /// Blocking variant used from `Drop`.
    fn release_blocking(&self, path: &Path) {
        if !self.owns(path) {
            return;
        }
        self.unreserve(path);
        match std::fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "Failed to delete workspace: {}", e),
        }
    }

    /// Purge workspace directories not tracked as live and older than `max_age`.
    ///
    /// Safety net for crash-induced leaks; returns how many were removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let root = &self.inner.config.root;
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %root.display(), "Workspace sweep failed to read root: {}", e);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Workspace sweep stopped early: {}", e);
                    break;
                }
            };
            let path = entry.path();
            let is_workspace = entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with(WORKSPACE_PREFIX))
                .unwrap_or(false);
            if !is_workspace || self.state().live.contains_key(&path) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!(path = %path.display(), age_secs = age.as_secs(), "Swept orphaned workspace");
                }
                Err(e) => warn!(path = %path.display(), "Failed to sweep workspace: {}", e),
            }
        }

        if removed > 0 {
            counter!("vfetch_workspaces_swept_total").increment(removed as u64);
        }
        removed
    }

    pub fn stats(&self) -> WorkspaceStats {
        let state = self.state();
        WorkspaceStats {
            live: state.live.len(),
            reserved_bytes: state.reserved(),
            allocated_total: state.allocated_total,
            released_total: state.released_total,
        }
    }

    fn owns(&self, path: &Path) -> bool {
        path.parent() == Some(self.inner.config.root.as_path())
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(WORKSPACE_PREFIX))
                .unwrap_or(false)
    }

    fn unreserve(&self, path: &Path) {
        let live = {
            let mut state = self.state();
            if state.live.remove(path).is_none() {
                return;
            }
            state.released_total += 1;
            state.live.len()
        };
        gauge!("vfetch_workspaces_live").set(live as f64);
    }

    #[cfg(unix)]
    fn check_free_space(&self) -> MediaResult<()> {
        let config = &self.inner.config;
        if config.min_free_bytes == 0 {
            return Ok(());
        }
        let stat = nix::sys::statvfs::statvfs(&config.root)
            .map_err(|e| MediaError::internal(format!("statvfs failed: {e}")))?;
        let available = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
        let needed = config.job_quota_bytes.saturating_add(config.min_free_bytes);
        if available < needed {
            return Err(MediaError::resource_exhausted(format!(
                "insufficient disk space ({available} bytes free, {needed} required)"
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_free_space(&self) -> MediaResult<()> {
        Ok(())
    }
}

/// A directory owned by exactly one job.
///
/// Call [`Workspace::release`] when done. Dropping an unreleased workspace
/// deletes it synchronously as a last resort.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    job_id: JobId,
    quota_bytes: u64,
    manager: WorkspaceManager,
    released: AtomicBool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Delete the directory. Only the first call does any work.
    pub async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.manager.release(&self.path).await;
        }
    }

    /// Total size of all files in the workspace.
    pub async fn size_bytes(&self) -> MediaResult<u64> {
        dir_size(&self.path).await
    }

    /// Fail with `ResourceExhausted` if the workspace outgrew its quota.
    pub async fn enforce_quota(&self) -> MediaResult<u64> {
        let used = self.size_bytes().await?;
        if used > self.quota_bytes {
            return Err(MediaError::resource_exhausted(format!(
                "job used {used} bytes, quota is {} bytes",
                self.quota_bytes
            )));
        }
        Ok(used)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            warn!(job_id = %self.job_id, path = %self.path.display(), "Workspace dropped without release, deleting");
            self.manager.release_blocking(&self.path);
        }
    }
}

/// Recursive size of regular files under `root`. Symlinks are not followed.
pub async fn dir_size(root: &Path) -> MediaResult<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }
    Ok(total)
}
