use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AcquireError;
use crate::manifest::{FileKind, ManifestEntry};

/// Lifecycle of a single task. Transitions are monotone: a task never
/// returns to `Pending`, and terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Expected content hash of a finished download, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedHash {
    Sha1(String),
    Sha256(String),
}

impl ExpectedHash {
    pub fn hex(&self) -> &str {
        match self {
            ExpectedHash::Sha1(hex) | ExpectedHash::Sha256(hex) => hex,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            ExpectedHash::Sha1(_) => "sha1",
            ExpectedHash::Sha256(_) => "sha256",
        }
    }
}

/// One source-to-destination file transfer. Identity is the destination
/// path; a session never runs two tasks against the same destination.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub dest: PathBuf,
    pub expected_size: Option<u64>,
    pub expected_hash: Option<ExpectedHash>,
    pub kind: FileKind,
    /// A failing critical task cancels all not-yet-started work.
    pub critical: bool,
    pub status: TaskStatus,
    pub retries: u32,
    pub last_error: Option<String>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            expected_size: None,
            expected_hash: None,
            kind: FileKind::Regular,
            critical: false,
            status: TaskStatus::Pending,
            retries: 0,
            last_error: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_hash(mut self, hash: ExpectedHash) -> Self {
        self.expected_hash = Some(hash);
        self
    }

    pub fn with_kind(mut self, kind: FileKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Build a task from a manifest entry, rooted at the destination
    /// directory. Entry paths are validated at manifest parse time.
    pub fn from_entry(root: &Path, entry: &ManifestEntry) -> Self {
        let mut task = Self::new(entry.url.clone(), root.join(&entry.path));
        task.expected_size = entry.size;
        task.expected_hash = entry.expected_hash();
        task.kind = entry.kind;
        task
    }

    pub(crate) fn advance(&mut self, next: TaskStatus) {
        debug_assert!(
            !self.status.is_terminal(),
            "task {:?} already terminal",
            self.dest
        );
        debug_assert!(
            next != TaskStatus::Pending,
            "tasks never return to Pending"
        );
        self.status = next;
    }
}

/// Retry schedule applied per task, independently of its siblings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay inserted before the given 1-based attempt. The first attempt
    /// starts immediately; attempt k+1 waits `base * multiplier^(k-1)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_delay.mul_f64(self.multiplier.powi(attempt as i32 - 2))
    }
}

/// Terminal record for one task, collected into the session report.
#[derive(Debug)]
pub struct TaskOutcome {
    pub url: String,
    pub dest: PathBuf,
    pub status: TaskStatus,
    pub retries: u32,
    pub error: Option<AcquireError>,
}

impl TaskOutcome {
    pub(crate) fn from_task(task: DownloadTask, error: Option<AcquireError>) -> Self {
        Self {
            url: task.url,
            dest: task.dest,
            status: task.status,
            retries: task.retries,
            error,
        }
    }
}
