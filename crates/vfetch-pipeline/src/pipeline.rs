//! Job pipeline.
//!
//! One job exists per dedup key at a time. Every [`JobHandle`] and
//! [`ResultLease`] holds one reference to its job; references are counted
//! under the registry lock, and every state transition happens under that
//! same lock so reference accounting never races a transition.
//!
//! - Last reference gone while the job is in flight: the job is abandoned
//!   (removed from the registry, process group killed, workspace released,
//!   ends `Failed` with kind `Killed`).
//! - Last reference gone once a result exists: a purge is scheduled after
//!   the reuse window and only proceeds if nobody re-attached meanwhile.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};
use vfetch_media::{
    DownloadStage, Downloader, MediaError, MediaResult, SourcePolicy, SourceUrl, TranscodeStage,
    Transcoder, Workspace, WorkspaceManager, WorkspaceStats,
};
use vfetch_models::{
    DedupKey, FailureKind, JobFailure, JobId, JobSnapshot, JobState, OutputFormat, ResultInfo,
    TargetFormat,
};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Extra time granted to job tasks on shutdown on top of the kill grace.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // No critical section panics halfway through an update.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Finished result file owned by a job.
struct JobOutput {
    workspace: Workspace,
    path: PathBuf,
}

struct JobEntry {
    id: JobId,
    key: DedupKey,
    state: watch::Sender<JobSnapshot>,
    cancel: watch::Sender<bool>,
    output: Mutex<Option<JobOutput>>,
}

impl JobEntry {
    fn new(id: JobId, key: DedupKey, source: &SourceUrl, format: TargetFormat) -> Self {
        let (state, _) = watch::channel(JobSnapshot::queued(id.clone(), source.as_str(), format));
        let (cancel, _) = watch::channel(false);
        Self {
            id,
            key,
            state,
            cancel,
            output: Mutex::new(None),
        }
    }

    fn current_state(&self) -> JobState {
        self.state.borrow().state
    }

    fn snapshot(&self) -> JobSnapshot {
        self.state.borrow().clone()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Apply `next` and `update` atomically; notifies waiters only on success.
    fn transition(&self, next: JobState, update: impl FnOnce(&mut JobSnapshot)) -> bool {
        self.state.send_if_modified(|snapshot| {
            if !snapshot.advance(next) {
                return false;
            }
            update(snapshot);
            true
        })
    }

    fn result_path(&self) -> Option<PathBuf> {
        lock(&self.output).as_ref().map(|o| o.path.clone())
    }

    fn take_output(&self) -> Option<JobOutput> {
        lock(&self.output).take()
    }
}

struct JobSlot {
    entry: Arc<JobEntry>,
    refs: usize,
    /// Bumped whenever a reference is added or the count drops to zero.
    epoch: u64,
    /// A detached submission holds one reference until the job settles.
    pinned: bool,
    last_active: Instant,
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<DedupKey, JobId>,
    jobs: HashMap<JobId, JobSlot>,
    history: VecDeque<JobSnapshot>,
}

impl Registry {
    fn slot_mut(&mut self, id: &JobId) -> Option<&mut JobSlot> {
        self.jobs.get_mut(id)
    }

    /// Add a reference to the live job registered under `key`.
    fn attach_key(&mut self, key: &DedupKey) -> Option<Arc<JobEntry>> {
        let id = self.by_key.get(key)?.clone();
        self.attach_id(&id)
    }

    fn attach_id(&mut self, id: &JobId) -> Option<Arc<JobEntry>> {
        let slot = self.slot_mut(id)?;
        if slot.entry.current_state().is_terminal() {
            return None;
        }
        slot.refs += 1;
        slot.epoch += 1;
        slot.last_active = Instant::now();
        Some(slot.entry.clone())
    }

    fn remove(&mut self, entry: &JobEntry) {
        self.jobs.remove(&entry.id);
        if self.by_key.get(&entry.key) == Some(&entry.id) {
            self.by_key.remove(&entry.key);
        }
    }

    fn record_terminal(&mut self, mut snapshot: JobSnapshot, limit: usize) {
        if limit == 0 {
            return;
        }
        snapshot.references = 0;
        self.history.push_back(snapshot);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// Counters for readiness and status endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub active_jobs: usize,
    pub queued: usize,
    pub downloading: usize,
    pub transcoding: usize,
    pub ready: usize,
    pub served: usize,
    pub history: usize,
    pub available_slots: usize,
    pub workspaces: WorkspaceStats,
}

/// Outcome of one sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orphans_removed: usize,
    pub jobs_evicted: usize,
}

struct StageResult {
    path: PathBuf,
    info: ResultInfo,
}

struct Inner {
    config: PipelineConfig,
    policy: SourcePolicy,
    workspaces: WorkspaceManager,
    downloader: Arc<dyn Downloader>,
    transcoder: Arc<dyn Transcoder>,
    permits: Arc<Semaphore>,
    registry: Mutex<Registry>,
    tasks: TaskTracker,
    shutting_down: AtomicBool,
}

/// Coalesces identical requests and runs download/transcode jobs.
#[derive(Clone)]
pub struct JobPipeline {
    inner: Arc<Inner>,
}

impl JobPipeline {
    /// Build a pipeline backed by yt-dlp and FFmpeg.
    pub async fn new(config: PipelineConfig) -> PipelineResult<Self> {
        let policy = SourcePolicy::new(&config.allowed_hosts);
        let downloader = Arc::new(DownloadStage::new(config.downloader.clone(), policy));
        let transcoder = Arc::new(TranscodeStage::new(config.transcoder.clone()));
        Self::with_stages(config, downloader, transcoder).await
    }

    /// Build a pipeline with custom stage implementations.
    pub async fn with_stages(
        config: PipelineConfig,
        downloader: Arc<dyn Downloader>,
        transcoder: Arc<dyn Transcoder>,
    ) -> PipelineResult<Self> {
        let workspaces = WorkspaceManager::new(config.workspace.clone()).await?;
        let policy = SourcePolicy::new(&config.allowed_hosts);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        info!(
            root = %config.workspace.root.display(),
            max_concurrent_jobs = config.max_concurrent_jobs,
            allowed_hosts = ?config.allowed_hosts,
            "Job pipeline ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                policy,
                workspaces,
                downloader,
                transcoder,
                permits,
                registry: Mutex::new(Registry::default()),
                tasks: TaskTracker::new(),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.inner.workspaces
    }

    pub fn policy(&self) -> &SourcePolicy {
        &self.inner.policy
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Submit a request, attaching to the live job for the same key if any.
    ///
    /// The URL is validated first; a rejected URL never allocates a workspace
    /// or spawns a process.
    pub fn submit(&self, url: &str, format: TargetFormat) -> PipelineResult<JobHandle> {
        if self.is_shutting_down() {
            return Err(PipelineError::ShuttingDown);
        }
        let source = self.inner.policy.validate(url)?;
        let key = DedupKey::new(source.normalized(), format);

        let mut registry = lock(&self.inner.registry);
        if self.is_shutting_down() {
            return Err(PipelineError::ShuttingDown);
        }
        if let Some(entry) = registry.attach_key(&key) {
            drop(registry);
            metrics::record_job_coalesced();
            debug!(job_id = %entry.id, key = %key, "Attached to existing job");
            return Ok(JobHandle::new(self.inner.clone(), entry, true));
        }

        let id = JobId::new();
        let entry = Arc::new(JobEntry::new(id.clone(), key.clone(), &source, format));
        registry.by_key.insert(key, id.clone());
        registry.jobs.insert(
            id,
            JobSlot {
                entry: entry.clone(),
                refs: 1,
                epoch: 0,
                pinned: false,
                last_active: Instant::now(),
            },
        );
        let active = registry.jobs.len();
        drop(registry);

        metrics::record_job_created();
        metrics::set_active_jobs(active);

        let inner = self.inner.clone();
        let task_entry = entry.clone();
        self.inner
            .tasks
            .spawn(async move { inner.run_job(task_entry, source, format).await });

        Ok(JobHandle::new(self.inner.clone(), entry, false))
    }

    /// Add a reference to a live job by id.
    pub fn attach(&self, job_id: &JobId) -> PipelineResult<JobHandle> {
        let entry = lock(&self.inner.registry)
            .attach_id(job_id)
            .ok_or_else(|| PipelineError::NotFound(job_id.clone()))?;
        Ok(JobHandle::new(self.inner.clone(), entry, true))
    }

    /// Current snapshot of a live job, or its final snapshot from history.
    pub fn snapshot(&self, job_id: &JobId) -> Option<JobSnapshot> {
        let registry = lock(&self.inner.registry);
        if let Some(slot) = registry.jobs.get(job_id) {
            let mut snapshot = slot.entry.snapshot();
            snapshot.references = slot.refs;
            return Some(snapshot);
        }
        registry
            .history
            .iter()
            .rev()
            .find(|s| &s.job_id == job_id)
            .cloned()
    }

    pub fn stats(&self) -> PipelineStats {
        let registry = lock(&self.inner.registry);
        let mut stats = PipelineStats {
            active_jobs: registry.jobs.len(),
            history: registry.history.len(),
            available_slots: self.inner.permits.available_permits(),
            workspaces: self.inner.workspaces.stats(),
            ..Default::default()
        };
        for slot in registry.jobs.values() {
            match slot.entry.current_state() {
                JobState::Queued => stats.queued += 1,
                JobState::Downloading => stats.downloading += 1,
                JobState::Transcoding => stats.transcoding += 1,
                JobState::Ready => stats.ready += 1,
                JobState::Served => stats.served += 1,
                JobState::Purged | JobState::Failed => {}
            }
        }
        stats
    }

    /// Force-purge finished jobs whose last activity is older than `max_idle`,
    /// even if a reader is still attached.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let victims: Vec<(Arc<JobEntry>, Option<JobOutput>)> = {
            let mut registry = lock(&self.inner.registry);
            let idle: Vec<Arc<JobEntry>> = registry
                .jobs
                .values()
                .filter(|s| s.entry.current_state().has_result() && s.last_active.elapsed() >= max_idle)
                .map(|s| s.entry.clone())
                .collect();
            idle.into_iter()
                .map(|entry| {
                    registry.remove(&entry);
                    let output = entry.take_output();
                    (entry, output)
                })
                .collect()
        };

        let count = victims.len();
        for (entry, output) in victims {
            warn!(job_id = %entry.id, "Evicting idle job");
            self.inner.finish_purge(&entry, output).await;
        }
        count
    }

    /// One pass of the background sweeper.
    pub async fn sweep_once(&self) -> SweepReport {
        let jobs_evicted = self.evict_idle(self.inner.config.idle_job_timeout).await;
        let orphans_removed = self
            .inner
            .workspaces
            .sweep(self.inner.config.sweep_max_age)
            .await;
        if jobs_evicted > 0 || orphans_removed > 0 {
            info!(jobs_evicted, orphans_removed, "Sweep finished");
        }
        SweepReport {
            orphans_removed,
            jobs_evicted,
        }
    }

    /// Run [`JobPipeline::sweep_once`] every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let pipeline = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if pipeline.is_shutting_down() {
                    break;
                }
                pipeline.sweep_once().await;
            }
            debug!("Sweeper stopped");
        })
    }

    /// Cancel every in-flight job, release every finished result, and wait
    /// for job tasks to clean up.
    pub async fn shutdown(&self) {
        let slots: Vec<JobSlot> = {
            let mut registry = lock(&self.inner.registry);
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            registry.by_key.clear();
            let slots: Vec<JobSlot> = registry.jobs.drain().map(|(_, slot)| slot).collect();
            for slot in &slots {
                if slot.entry.current_state().is_in_flight() {
                    slot.entry.cancel.send_replace(true);
                }
            }
            slots
        };

        info!(jobs = slots.len(), "Shutting down job pipeline");
        for slot in &slots {
            if slot.entry.current_state().has_result() {
                let output = slot.entry.take_output();
                self.inner.finish_purge(&slot.entry, output).await;
            }
        }

        self.inner.tasks.close();
        let grace = self.inner.config.downloader.kill_grace + SHUTDOWN_SLACK;
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!("Job tasks did not finish within {:?}", grace);
        }
    }
}

impl Inner {
    async fn run_job(self: Arc<Self>, entry: Arc<JobEntry>, source: SourceUrl, format: TargetFormat) {
        let logger = JobLogger::new(&entry.id, source.as_str());
        let span = logger.create_span();
        async move {
            logger.log_start(&format!("format={format}"));
            let mut cancel = entry.cancel.subscribe();

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit.ok(),
                _ = wait_cancelled(&mut cancel) => None,
            };
            let Some(_permit) = permit else {
                self.fail(&entry, &logger, self.cancelled_failure());
                return;
            };

            let workspace = match self.workspaces.allocate(&entry.id).await {
                Ok(workspace) => workspace,
                Err(e) => {
                    self.fail(&entry, &logger, e.to_failure());
                    return;
                }
            };

            match self
                .execute(&entry, &logger, &source, format, &workspace, cancel)
                .await
            {
                Ok(result) => self.complete(&entry, &logger, workspace, result).await,
                Err(e) => {
                    workspace.release().await;
                    let failure = if entry.is_cancelled() {
                        self.cancelled_failure()
                    } else {
                        e.to_failure()
                    };
                    self.fail(&entry, &logger, failure);
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        entry: &JobEntry,
        logger: &JobLogger,
        source: &SourceUrl,
        format: TargetFormat,
        workspace: &Workspace,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<StageResult> {
        self.enter(entry, JobState::Downloading)?;
        logger.log_progress("download", &format!("workspace={}", workspace.path().display()));
        let downloaded = self
            .downloader
            .download(source, workspace.path(), cancel.clone())
            .await?;
        workspace.enforce_quota().await?;

        let native = extension_of(&downloaded);
        let (path, transcoded) = match format.conversion_for(&native) {
            None => (downloaded, false),
            Some(target) => {
                self.enter(entry, JobState::Transcoding)?;
                logger.log_progress("transcode", &format!("{native} -> {target}"));
                let output = self.transcoder.transcode(&downloaded, target, cancel).await?;
                if let Err(e) = tokio::fs::remove_file(&downloaded).await {
                    logger.log_warning(&format!("failed to remove intermediate file: {e}"));
                }
                workspace.enforce_quota().await?;
                (output, true)
            }
        };

        let size_bytes = tokio::fs::metadata(&path).await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MediaError::internal("result path has no file name"))?;
        let content_type = OutputFormat::from_extension(&extension_of(&path))
            .map(|f| f.content_type())
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(StageResult {
            path,
            info: ResultInfo {
                file_name,
                content_type,
                size_bytes,
                transcoded,
            },
        })
    }

    /// Transition into a stage unless the job was cancelled.
    fn enter(&self, entry: &JobEntry, next: JobState) -> MediaResult<()> {
        let _registry = lock(&self.registry);
        if entry.is_cancelled() || !entry.transition(next, |_| {}) {
            return Err(MediaError::Cancelled);
        }
        Ok(())
    }

    async fn complete(
        self: &Arc<Self>,
        entry: &Arc<JobEntry>,
        logger: &JobLogger,
        workspace: Workspace,
        result: StageResult,
    ) {
        let StageResult { path, info } = result;
        let transcoded = info.transcoded;

        let (rejected, purge_epoch) = {
            let mut registry = lock(&self.registry);
            let ready = !entry.is_cancelled()
                && entry.transition(JobState::Ready, |s| s.result = Some(info));
            if ready {
                *lock(&entry.output) = Some(JobOutput { workspace, path });
                (None, registry.slot_mut(&entry.id).and_then(unpin))
            } else {
                (Some(workspace), None)
            }
        };

        if let Some(workspace) = rejected {
            workspace.release().await;
            self.fail(entry, logger, self.cancelled_failure());
            return;
        }

        metrics::record_job_completed(transcoded);
        logger.log_completion(&format!("ready (transcoded={transcoded})"));
        if let Some(epoch) = purge_epoch {
            self.schedule_purge(entry.clone(), epoch);
        }
    }

    fn fail(&self, entry: &JobEntry, logger: &JobLogger, failure: JobFailure) {
        let active = {
            let mut registry = lock(&self.registry);
            let failed = entry.transition(JobState::Failed, |s| s.error = Some(failure.clone()));
            if !failed {
                return;
            }
            registry.remove(entry);
            registry.record_terminal(entry.snapshot(), self.config.job_history_limit);
            registry.jobs.len()
        };
        logger.log_error(&failure.to_string());
        metrics::record_job_failed(failure.kind);
        metrics::set_active_jobs(active);
    }

    fn cancelled_failure(&self) -> JobFailure {
        let reason = if self.shutting_down.load(Ordering::SeqCst) {
            "job cancelled: service shutting down"
        } else {
            "job abandoned: every waiter disconnected"
        };
        JobFailure::new(FailureKind::Killed, reason)
    }

    fn mark_served(&self, entry: &JobEntry) {
        let _registry = lock(&self.registry);
        entry.transition(JobState::Served, |_| {});
    }

    /// Turn a detached handle's reference into a pin released on completion.
    /// Returns `false` if the job already settled and the reference should
    /// simply be released.
    fn pin(&self, entry: &JobEntry) -> bool {
        let mut registry = lock(&self.registry);
        let Some(slot) = registry.slot_mut(&entry.id) else {
            return false;
        };
        if !slot.entry.current_state().is_in_flight() {
            return false;
        }
        if slot.pinned {
            // One pin is enough; hand back this handle's reference.
            slot.refs = slot.refs.saturating_sub(1);
        } else {
            slot.pinned = true;
        }
        true
    }

    fn release_ref(self: &Arc<Self>, entry: &Arc<JobEntry>) {
        let purge_epoch = {
            let mut registry = lock(&self.registry);
            let Some(slot) = registry.slot_mut(&entry.id) else {
                return;
            };
            slot.refs = slot.refs.saturating_sub(1);
            slot.last_active = Instant::now();
            if slot.refs > 0 {
                return;
            }
            slot.epoch += 1;
            let epoch = slot.epoch;
            let state = entry.current_state();

            if state.is_in_flight() {
                registry.remove(entry);
                entry.cancel.send_replace(true);
                info!(job_id = %entry.id, state = %state, "Last waiter left, abandoning job");
                return;
            }
            if !state.has_result() {
                return;
            }
            epoch
        };
        self.schedule_purge(entry.clone(), purge_epoch);
    }

    fn schedule_purge(self: &Arc<Self>, entry: Arc<JobEntry>, epoch: u64) {
        let delay = self.config.result_reuse;
        let inner = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    inner.purge_if_unused(&entry, epoch).await;
                });
            }
            Err(_) => {
                // Outside a runtime: purge now; dropping the workspace deletes it.
                let output = {
                    let mut registry = lock(&self.registry);
                    match registry.slot_mut(&entry.id) {
                        Some(slot) if slot.refs == 0 && slot.epoch == epoch => {
                            registry.remove(&entry);
                            entry.take_output()
                        }
                        _ => return,
                    }
                };
                drop(output);
                self.record_purged(&entry);
            }
        }
    }

    async fn purge_if_unused(&self, entry: &Arc<JobEntry>, epoch: u64) {
        let output = {
            let mut registry = lock(&self.registry);
            match registry.slot_mut(&entry.id) {
                Some(slot) if slot.refs == 0 && slot.epoch == epoch => {
                    registry.remove(entry);
                    entry.take_output()
                }
                _ => return,
            }
        };
        self.finish_purge(entry, output).await;
    }

    /// Registry entry is already gone; release the workspace, then record `Purged`.
    async fn finish_purge(&self, entry: &JobEntry, output: Option<JobOutput>) {
        if let Some(output) = output {
            output.workspace.release().await;
        }
        self.record_purged(entry);
    }

    fn record_purged(&self, entry: &JobEntry) {
        let active = {
            let mut registry = lock(&self.registry);
            if !entry.transition(JobState::Purged, |_| {}) {
                return;
            }
            registry.record_terminal(entry.snapshot(), self.config.job_history_limit);
            registry.jobs.len()
        };
        debug!(job_id = %entry.id, "Job purged");
        metrics::record_job_purged();
        metrics::set_active_jobs(active);
    }
}

/// Drop the pin of a detached submission. Returns the purge epoch when that
/// was the last reference.
fn unpin(slot: &mut JobSlot) -> Option<u64> {
    if !slot.pinned {
        return None;
    }
    slot.pinned = false;
    slot.refs = slot.refs.saturating_sub(1);
    if slot.refs > 0 {
        return None;
    }
    slot.epoch += 1;
    Some(slot.epoch)
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Interest in a job. Dropping the last handle of an unfinished job
/// abandons it.
pub struct JobHandle {
    inner: Arc<Inner>,
    entry: Arc<JobEntry>,
    coalesced: bool,
    armed: bool,
}

impl JobHandle {
    fn new(inner: Arc<Inner>, entry: Arc<JobEntry>, coalesced: bool) -> Self {
        Self {
            inner,
            entry,
            coalesced,
            armed: true,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.entry.id
    }

    /// Whether this request attached to a job created by someone else.
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.entry.snapshot()
    }

    /// Keep the job running without a waiter. The job holds its own
    /// reference until it settles, after which the reuse window applies.
    pub fn detach(mut self) -> JobSnapshot {
        let snapshot = self.entry.snapshot();
        if self.inner.pin(&self.entry) {
            self.armed = false;
        }
        snapshot
    }

    /// Wait for the shared outcome.
    ///
    /// Checks the current state before sleeping, so a handle attached after
    /// the job finished resolves immediately.
    pub async fn wait(mut self) -> PipelineResult<ResultLease> {
        let mut rx = self.entry.state.subscribe();
        let snapshot = match rx
            .wait_for(|s| s.state.has_result() || s.state.is_terminal())
            .await
        {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => {
                return Err(PipelineError::job_failed(
                    self.entry.id.clone(),
                    JobFailure::new(FailureKind::InternalError, "job state channel closed"),
                ))
            }
        };

        if let (true, Some(info)) = (snapshot.state.has_result(), snapshot.result.clone()) {
            if let Some(path) = self.entry.result_path() {
                self.inner.mark_served(&self.entry);
                self.armed = false;
                return Ok(ResultLease {
                    inner: self.inner.clone(),
                    entry: self.entry.clone(),
                    path,
                    info,
                });
            }
        }

        let failure = snapshot.error.unwrap_or_else(|| {
            JobFailure::new(FailureKind::InternalError, "result is no longer available")
        });
        Err(PipelineError::job_failed(self.entry.id.clone(), failure))
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_ref(&self.entry);
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.entry.id)
            .field("coalesced", &self.coalesced)
            .finish()
    }
}

/// Read access to a finished result. The workspace stays on disk until the
/// last lease is dropped and the reuse window has passed.
pub struct ResultLease {
    inner: Arc<Inner>,
    entry: Arc<JobEntry>,
    path: PathBuf,
    info: ResultInfo,
}

impl ResultLease {
    pub fn job_id(&self) -> &JobId {
        &self.entry.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &ResultInfo {
        &self.info
    }

    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

impl Drop for ResultLease {
    fn drop(&mut self) {
        self.inner.release_ref(&self.entry);
    }
}

impl std::fmt::Debug for ResultLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultLease")
            .field("job_id", &self.entry.id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpin() {
        let id = JobId::new();
        let policy = SourcePolicy::new(["loom.com"]);
        let source = policy.validate("https://loom.com/share/abc").unwrap();
        let key = DedupKey::new(source.normalized(), TargetFormat::Native);
        let mut slot = JobSlot {
            entry: Arc::new(JobEntry::new(id, key, &source, TargetFormat::Native)),
            refs: 2,
            epoch: 3,
            pinned: true,
            last_active: Instant::now(),
        };
        assert_eq!(unpin(&mut slot), None);
        assert_eq!(slot.refs, 1);
        assert_eq!(unpin(&mut slot), None);

        slot.pinned = true;
        assert_eq!(unpin(&mut slot), Some(4));
        assert_eq!(slot.refs, 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut registry = Registry::default();
        for i in 0..5 {
            let snap = JobSnapshot::queued(JobId::from_string(format!("j{i}")), "u", TargetFormat::Native);
            registry.record_terminal(snap, 3);
        }
        assert_eq!(registry.history.len(), 3);
        assert_eq!(registry.history[0].job_id.as_str(), "j2");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("/ws/abc.WebM")), "webm");
        assert_eq!(extension_of(Path::new("/ws/abc")), "");
    }
}
