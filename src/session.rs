// ─── Download Session ───
// Top-level orchestrator: owns the configuration, the task queue, the
// progress aggregator and the worker pool; runs Created → Running →
// {Completed, Failed, Cancelled} exactly once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AcquireError, AcquireResult};
use crate::http::build_http_client;
use crate::manifest::ManifestResolver;
use crate::progress::{ProgressAggregator, ProgressSnapshot};
use crate::queue::TaskQueue;
use crate::task::{DownloadTask, RetryPolicy, TaskOutcome, TaskStatus};
use crate::transfer;

/// What cancellation does to transfers already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// In-flight transfers run to completion; only queued work is dropped.
    Graceful,
    /// In-flight transfers abort at the next chunk boundary.
    Hard,
}

/// What happens to the partial file of a task that ends Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Delete,
    /// Rename the partial file to `<dest>.invalid` for inspection.
    KeepTagged,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed worker count for the session's lifetime.
    pub workers: usize,
    /// Bytes copied per read/write cycle.
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub cancel_mode: CancelMode,
    pub failure_policy: FailurePolicy,
    /// Free-space preflight against the first task's destination disk.
    pub min_free_bytes: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            chunk_size: 8 * 1024,
            retry: RetryPolicy::default(),
            cancel_mode: CancelMode::Graceful,
            failure_policy: FailurePolicy::Delete,
            min_free_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Aggregate result of one session run: the terminal session state plus
/// the terminal status (and error, if Failed) of every task.
#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    pub outcomes: Vec<TaskOutcome>,
}

impl SessionReport {
    pub fn completed(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskStatus::Cancelled)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }
}

/// Concurrent download session. All methods take `&self`, so a session can
/// be shared behind an `Arc` to feed tasks or cancel while `run` is in
/// flight.
pub struct DownloadSession {
    config: SessionConfig,
    client: reqwest::Client,
    queue: Arc<TaskQueue>,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    seen_dests: Mutex<HashSet<PathBuf>>,
    preflight_root: OnceLock<PathBuf>,
}

impl DownloadSession {
    pub fn new(config: SessionConfig) -> AcquireResult<Self> {
        Ok(Self::with_client(config, build_http_client()?))
    }

    pub fn with_client(config: SessionConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            queue: Arc::new(TaskQueue::new()),
            progress: Arc::new(ProgressAggregator::new()),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Created),
            seen_dests: Mutex::new(HashSet::new()),
            preflight_root: OnceLock::new(),
        }
    }

    /// Enqueue one task. Allowed while workers are already draining the
    /// queue; rejected once intake is closed. A task whose destination was
    /// already added is deduplicated so no two transfers race one path.
    pub fn add_task(&self, task: DownloadTask) -> AcquireResult<()> {
        {
            let mut seen = self.seen_dests.lock().expect("session dest set poisoned");
            if !seen.insert(task.dest.clone()) {
                debug!(dest = ?task.dest, "duplicate destination, task deduplicated");
                return Ok(());
            }
        }
        let preflight = task
            .dest
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| task.dest.clone());
        let _ = self.preflight_root.set(preflight);

        let expected_size = task.expected_size;
        self.progress.register_task(expected_size);
        if let Err(task) = self.queue.push(task) {
            self.progress.deregister_task(expected_size);
            self.seen_dests
                .lock()
                .expect("session dest set poisoned")
                .remove(&task.dest);
            return Err(AcquireError::InvalidState("task intake is closed"));
        }
        Ok(())
    }

    /// Resolve a remote manifest for one platform and fan its entries out
    /// into this session. Returns the number of tasks staged. Resolution
    /// failures abort before any task is created.
    pub async fn stage_manifest(
        &self,
        manifest_url: &str,
        platform: &str,
        root: &Path,
    ) -> AcquireResult<usize> {
        let resolver = ManifestResolver::with_client(self.client.clone());
        let tasks = resolver.resolve(manifest_url, platform, root).await?;
        let count = tasks.len();
        for task in tasks {
            self.add_task(task)?;
        }
        info!(platform, count, "manifest staged into session");
        Ok(count)
    }

    /// Stop accepting new tasks; `run` returns once the remainder drains.
    pub fn close_intake(&self) {
        self.queue.close();
    }

    /// Trip the session-wide cancellation signal. Workers stop dequeuing
    /// immediately; in-flight transfers follow the configured cancel mode.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Convenience wrapper: enqueue the given tasks, close intake and run.
    pub async fn run_all(
        &self,
        tasks: impl IntoIterator<Item = DownloadTask>,
    ) -> AcquireResult<SessionReport> {
        for task in tasks {
            self.add_task(task)?;
        }
        self.close_intake();
        self.run().await
    }

    /// Start the worker pool and block until the queue is closed and
    /// drained with no worker active. Per-task failures never raise out of
    /// here; inspect the report. Terminal sessions cannot be re-run.
    pub async fn run(&self) -> AcquireResult<SessionReport> {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if *state != SessionState::Created {
                return Err(AcquireError::InvalidState(
                    "session already ran; construct a new session to retry",
                ));
            }
            *state = SessionState::Running;
        }
        info!(
            workers = self.config.workers,
            pending = self.queue.len(),
            "download session starting"
        );

        if let Some(required) = self.config.min_free_bytes {
            if let Some(root) = self.preflight_root.get() {
                if let Err(err) = ensure_min_disk_space(root, required) {
                    *self.state.lock().expect("session state poisoned") = SessionState::Failed;
                    return Err(err);
                }
            }
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            workers.spawn(worker_loop(WorkerContext {
                id,
                client: self.client.clone(),
                config: self.config.clone(),
                queue: Arc::clone(&self.queue),
                progress: Arc::clone(&self.progress),
                cancel: self.cancel.clone(),
            }));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(mut worker_outcomes) => outcomes.append(&mut worker_outcomes),
                Err(err) => warn!(error = %err, "worker task aborted"),
            }
        }

        // Tasks that cancellation kept from ever starting.
        for mut task in self.queue.drain() {
            task.advance(TaskStatus::Cancelled);
            outcomes.push(TaskOutcome::from_task(task, None));
        }

        let state = if outcomes
            .iter()
            .any(|outcome| outcome.status == TaskStatus::Failed)
        {
            SessionState::Failed
        } else if self.cancel.is_cancelled() {
            SessionState::Cancelled
        } else {
            SessionState::Completed
        };
        *self.state.lock().expect("session state poisoned") = state;

        let snapshot = self.progress.snapshot();
        info!(
            ?state,
            completed = snapshot.completed,
            total = snapshot.total,
            bytes = snapshot.bytes_transferred,
            "download session finished"
        );
        Ok(SessionReport { state, outcomes })
    }
}

struct WorkerContext {
    id: usize,
    client: reqwest::Client,
    config: SessionConfig,
    queue: Arc<TaskQueue>,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationToken,
}

/// One worker: dequeue → transfer → record, until the queue drains or the
/// session is cancelled. At no instant do more transfers run than workers.
async fn worker_loop(ctx: WorkerContext) -> Vec<TaskOutcome> {
    let transfer_ctx = transfer::TransferContext {
        client: &ctx.client,
        chunk_size: ctx.config.chunk_size.max(1),
        retry: &ctx.config.retry,
        cancel_mode: ctx.config.cancel_mode,
        failure_policy: ctx.config.failure_policy,
        cancel: &ctx.cancel,
        progress: ctx.progress.as_ref(),
    };

    let mut outcomes = Vec::new();
    loop {
        let task = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            task = ctx.queue.pop() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let mut task = task;
        task.advance(TaskStatus::InProgress);
        debug!(worker = ctx.id, url = %task.url, "transfer started");

        match transfer::execute(&transfer_ctx, &mut task).await {
            Ok(()) => {
                task.advance(TaskStatus::Completed);
                ctx.progress.task_completed();
                outcomes.push(TaskOutcome::from_task(task, None));
            }
            Err(AcquireError::Cancelled) => {
                task.advance(TaskStatus::Cancelled);
                outcomes.push(TaskOutcome::from_task(task, None));
            }
            Err(err) => {
                warn!(worker = ctx.id, url = %task.url, error = %err, "transfer failed");
                task.advance(TaskStatus::Failed);
                task.last_error = Some(err.to_string());
                if task.critical {
                    warn!(url = %task.url, "critical task failed, cancelling remaining work");
                    ctx.cancel.cancel();
                }
                outcomes.push(TaskOutcome::from_task(task, Some(err)));
            }
        }
    }
    outcomes
}

/// Refuse to start a session that would run the destination disk out of
/// space mid-acquisition.
pub fn ensure_min_disk_space(path: &Path, minimum_bytes: u64) -> AcquireResult<()> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root = existing_ancestor(path);
    let canonical = std::fs::canonicalize(&root).unwrap_or(root);
    let mut best_len = 0usize;
    let mut available = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if canonical.starts_with(mount) {
            let len = mount.as_os_str().len();
            if len >= best_len {
                best_len = len;
                available = Some(disk.available_space());
            }
        }
    }
    if let Some(bytes) = available {
        if bytes < minimum_bytes {
            return Err(AcquireError::InsufficientSpace {
                available: bytes,
                required: minimum_bytes,
            });
        }
    }
    Ok(())
}

/// Nearest ancestor of `path` that exists on disk. Destinations are
/// usually created during the session, so the raw path rarely resolves.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_bounded() {
        let config = SessionConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.chunk_size, 8 * 1024);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cancel_mode, CancelMode::Graceful);
        assert_eq!(config.failure_policy, FailurePolicy::Delete);
    }

    #[test]
    fn duplicate_destinations_are_deduplicated() {
        let session = DownloadSession::new(SessionConfig::default()).unwrap();
        session
            .add_task(DownloadTask::new("http://example.invalid/1", "/tmp/same"))
            .unwrap();
        session
            .add_task(DownloadTask::new("http://example.invalid/2", "/tmp/same"))
            .unwrap();
        assert_eq!(session.pending(), 1);
        assert_eq!(session.progress().total, 1);
    }

    #[test]
    fn add_after_close_is_rejected() {
        let session = DownloadSession::new(SessionConfig::default()).unwrap();
        session.close_intake();
        let err = session
            .add_task(DownloadTask::new("http://example.invalid/1", "/tmp/x"))
            .unwrap_err();
        assert!(matches!(err, AcquireError::InvalidState(_)));
        assert_eq!(session.progress().total, 0);
    }

    #[test]
    fn preflight_resolves_unborn_destinations_to_an_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("runtime/bin/java");
        assert_eq!(existing_ancestor(&dest), dir.path());

        assert!(ensure_min_disk_space(&dest, 1).is_ok());

        let canonical = dir.path().canonicalize().unwrap();
        let covered = sysinfo::Disks::new_with_refreshed_list()
            .list()
            .iter()
            .any(|disk| canonical.starts_with(disk.mount_point()));
        if covered {
            let err = ensure_min_disk_space(&dest, u64::MAX).unwrap_err();
            assert!(matches!(err, AcquireError::InsufficientSpace { .. }));
        }
    }

    #[tokio::test]
    async fn empty_session_completes_and_cannot_be_rerun() {
        let session = DownloadSession::new(SessionConfig::default()).unwrap();
        session.close_intake();
        let report = session.run().await.unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert!(report.outcomes.is_empty());
        assert_eq!(session.state(), SessionState::Completed);

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, AcquireError::InvalidState(_)));
    }
}
