use std::path::PathBuf;
use thiserror::Error;

/// Central error type for the acquisition engine.
/// Every module returns `Result<T, AcquireError>`.
#[derive(Debug, Error)]
pub enum AcquireError {
    // ── IO ──────────────────────────────────────────────
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("insufficient disk space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    // ── Network ─────────────────────────────────────────
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download failed for {url}: HTTP {status}")]
    DownloadFailed { url: String, status: u16 },

    // ── Manifest ────────────────────────────────────────
    #[error("platform {platform} not present in manifest")]
    UnsupportedPlatform { platform: String },

    #[error("manifest fetch failed for {url}: {source}")]
    ManifestFetch { url: String, source: reqwest::Error },

    #[error("manifest invalid: {0}")]
    ManifestParse(String),

    // ── Transfer ────────────────────────────────────────
    #[error("transfer of {url} failed after {attempts} attempts: {source}")]
    Transfer {
        url: String,
        attempts: u32,
        source: Box<AcquireError>,
    },

    #[error("integrity mismatch for {path:?}: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ── Session ─────────────────────────────────────────
    #[error("session cancelled")]
    Cancelled,

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
}

/// Convenience alias used throughout the crate.
pub type AcquireResult<T> = Result<T, AcquireError>;
