// ─── Airlift ───
// Concurrent, manifest-driven acquisition engine for large binary bundles
// (runtime distributions, game assets).
//
// Architecture:
//   manifest — remote descriptor fetch + parse + per-platform fan-out
//   task     — download task entity, retry policy, per-task outcome
//   queue    — async FIFO feeding the worker pool, open for late insertion
//   transfer — chunked streaming fetch with retry, backoff and verification
//   progress — atomic aggregate counters pushed over a watch channel
//   session  — top-level orchestrator: worker pool, cancellation, report

pub mod error;
pub mod http;
pub mod manifest;
pub mod progress;
pub mod queue;
pub mod session;
pub mod task;

mod transfer;

pub use error::{AcquireError, AcquireResult};
pub use manifest::{FileKind, ManifestEntry, ManifestResolver, RuntimeManifest};
pub use progress::ProgressSnapshot;
pub use session::{
    CancelMode, DownloadSession, FailurePolicy, SessionConfig, SessionReport, SessionState,
};
pub use task::{DownloadTask, ExpectedHash, RetryPolicy, TaskOutcome, TaskStatus};
