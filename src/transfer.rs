// ─── File Transfer Unit ───
// Per-task streaming fetch: chunked read/write loop into a staging file,
// retry with exponential backoff, post-transfer integrity verification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AcquireError, AcquireResult};
use crate::manifest::FileKind;
use crate::progress::ProgressAggregator;
use crate::session::{CancelMode, FailurePolicy};
use crate::task::{DownloadTask, ExpectedHash, RetryPolicy};

pub(crate) struct TransferContext<'a> {
    pub client: &'a reqwest::Client,
    pub chunk_size: usize,
    pub retry: &'a RetryPolicy,
    pub cancel_mode: CancelMode,
    pub failure_policy: FailurePolicy,
    pub cancel: &'a CancellationToken,
    pub progress: &'a ProgressAggregator,
}

/// Classifies an attempt failure for the retry loop. Transport and write
/// errors are transient; integrity mismatches, filesystem setup failures
/// and cancellation are terminal.
enum AttemptError {
    Transient(AcquireError),
    Fatal(AcquireError),
}

/// Move the task's bytes from source to destination, retrying transient
/// failures per the retry policy. `Ok` means the file is in place and
/// verified; `Err(Cancelled)` means a hard cancel aborted the task,
/// whether mid-stream, between attempts or during backoff.
pub(crate) async fn execute(
    ctx: &TransferContext<'_>,
    task: &mut DownloadTask,
) -> AcquireResult<()> {
    if destination_is_current(task).await {
        debug!(dest = ?task.dest, "destination already up to date, skipping fetch");
        return Ok(());
    }

    if let Some(parent) = task.dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| AcquireError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    loop {
        let staging = staging_path(&task.dest);
        match attempt(ctx, task, &staging).await {
            Ok(written) => {
                debug!(url = %task.url, bytes = written, "transfer complete");
                return Ok(());
            }
            Err(AttemptError::Fatal(err)) => {
                if matches!(err, AcquireError::Cancelled) {
                    let _ = tokio::fs::remove_file(&staging).await;
                } else {
                    apply_failure_policy(ctx.failure_policy, task, &staging).await;
                }
                return Err(err);
            }
            Err(AttemptError::Transient(cause)) => {
                task.retries += 1;
                if task.retries >= ctx.retry.max_attempts {
                    apply_failure_policy(ctx.failure_policy, task, &staging).await;
                    return Err(AcquireError::Transfer {
                        url: task.url.clone(),
                        attempts: task.retries,
                        source: Box::new(cause),
                    });
                }
                let _ = tokio::fs::remove_file(&staging).await;
                let delay = ctx.retry.delay_before(task.retries + 1);
                debug!(
                    url = %task.url,
                    retry = task.retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %cause,
                    "transient transfer failure, backing off"
                );
                backoff(ctx, delay).await?;
            }
        }
    }
}

/// One full transfer attempt, always restarting from byte zero.
async fn attempt(
    ctx: &TransferContext<'_>,
    task: &DownloadTask,
    staging: &Path,
) -> Result<u64, AttemptError> {
    check_cancelled(ctx)?;
    let response = ctx
        .client
        .get(&task.url)
        .send()
        .await
        .map_err(|err| AttemptError::Transient(AcquireError::Http(err)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AttemptError::Transient(AcquireError::DownloadFailed {
            url: task.url.clone(),
            status: status.as_u16(),
        }));
    }

    let mut file = tokio::fs::File::create(staging).await.map_err(|source| {
        AttemptError::Fatal(AcquireError::Io {
            path: staging.to_path_buf(),
            source,
        })
    })?;

    let mut hasher = task.expected_hash.as_ref().map(TransferHasher::new);
    let mut pending: Vec<u8> = Vec::with_capacity(ctx.chunk_size);
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(next) = stream.next().await {
        check_cancelled(ctx)?;
        let bytes = next.map_err(|err| AttemptError::Transient(AcquireError::Http(err)))?;
        pending.extend_from_slice(&bytes);
        while pending.len() >= ctx.chunk_size {
            let rest = pending.split_off(ctx.chunk_size);
            written += write_chunk(ctx, &mut file, &mut hasher, &pending, staging).await?;
            pending = rest;
            check_cancelled(ctx)?;
        }
    }
    if !pending.is_empty() {
        check_cancelled(ctx)?;
        written += write_chunk(ctx, &mut file, &mut hasher, &pending, staging).await?;
    }
    file.flush().await.map_err(|source| {
        AttemptError::Transient(AcquireError::Io {
            path: staging.to_path_buf(),
            source,
        })
    })?;
    drop(file);

    if let Some(expected) = task.expected_size {
        if written != expected {
            return Err(AttemptError::Fatal(AcquireError::Integrity {
                path: task.dest.clone(),
                expected: format!("{expected} bytes"),
                actual: format!("{written} bytes"),
            }));
        }
    }

    if let Some(expected) = &task.expected_hash {
        let actual = hasher
            .take()
            .map(TransferHasher::finalize_hex)
            .unwrap_or_default();
        if !actual.eq_ignore_ascii_case(expected.hex()) {
            return Err(AttemptError::Fatal(AcquireError::Integrity {
                path: task.dest.clone(),
                expected: format!("{}:{}", expected.algorithm(), expected.hex()),
                actual: format!("{}:{}", expected.algorithm(), actual),
            }));
        }
    }

    // Permissions go on while the file is still staged, so the failure
    // policy can act on it if chmod fails.
    if task.kind == FileKind::Executable {
        mark_executable(staging).await.map_err(AttemptError::Fatal)?;
    }

    tokio::fs::rename(staging, &task.dest).await.map_err(|source| {
        AttemptError::Fatal(AcquireError::Io {
            path: task.dest.clone(),
            source,
        })
    })?;

    Ok(written)
}

/// Sleep out the retry delay. A hard cancel interrupts the wait so no
/// further attempts reach the network.
async fn backoff(ctx: &TransferContext<'_>, delay: Duration) -> AcquireResult<()> {
    if ctx.cancel_mode == CancelMode::Hard {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(AcquireError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    } else {
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

async fn write_chunk(
    ctx: &TransferContext<'_>,
    file: &mut tokio::fs::File,
    hasher: &mut Option<TransferHasher>,
    chunk: &[u8],
    staging: &Path,
) -> Result<u64, AttemptError> {
    file.write_all(chunk).await.map_err(|source| {
        AttemptError::Transient(AcquireError::Io {
            path: staging.to_path_buf(),
            source,
        })
    })?;
    if let Some(hasher) = hasher.as_mut() {
        hasher.update(chunk);
    }
    ctx.progress.record_bytes(chunk.len() as u64);
    Ok(chunk.len() as u64)
}

fn check_cancelled(ctx: &TransferContext<'_>) -> Result<(), AttemptError> {
    if ctx.cancel_mode == CancelMode::Hard && ctx.cancel.is_cancelled() {
        return Err(AttemptError::Fatal(AcquireError::Cancelled));
    }
    Ok(())
}

/// Skip the fetch if the destination already holds the expected content.
async fn destination_is_current(task: &DownloadTask) -> bool {
    let Ok(meta) = tokio::fs::metadata(&task.dest).await else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    match &task.expected_hash {
        Some(expected) => file_hash_matches(&task.dest, expected)
            .await
            .unwrap_or(false),
        None => task.expected_size.is_some_and(|size| meta.len() == size),
    }
}

/// Hash an existing file and compare against the expected digest.
pub(crate) async fn file_hash_matches(path: &Path, expected: &ExpectedHash) -> AcquireResult<bool> {
    let bytes = tokio::fs::read(path).await.map_err(|source| AcquireError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = TransferHasher::new(expected);
    hasher.update(&bytes);
    Ok(hasher.finalize_hex().eq_ignore_ascii_case(expected.hex()))
}

async fn apply_failure_policy(policy: FailurePolicy, task: &DownloadTask, staging: &Path) {
    match policy {
        FailurePolicy::Delete => {
            let _ = tokio::fs::remove_file(staging).await;
        }
        FailurePolicy::KeepTagged => {
            let tagged = invalid_path(&task.dest);
            if tokio::fs::rename(staging, &tagged).await.is_ok() {
                warn!(path = ?tagged, "kept invalid download for inspection");
            } else {
                let _ = tokio::fs::remove_file(staging).await;
            }
        }
    }
}

async fn mark_executable(path: &Path) -> Result<(), AcquireError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|source| AcquireError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut perms = meta.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|source| AcquireError::Io {
                path: path.to_path_buf(),
                source,
            })?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Unique staging path next to the destination so the final rename stays
/// on one filesystem.
fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{}.{}.part", name, Uuid::new_v4()))
}

fn invalid_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{name}.invalid"))
}

enum TransferHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl TransferHasher {
    fn new(expected: &ExpectedHash) -> Self {
        match expected {
            ExpectedHash::Sha1(_) => TransferHasher::Sha1(Sha1::new()),
            ExpectedHash::Sha256(_) => TransferHasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            TransferHasher::Sha1(hasher) => hasher.update(bytes),
            TransferHasher::Sha256(hasher) => hasher.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            TransferHasher::Sha1(hasher) => hex::encode(hasher.finalize()),
            TransferHasher::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DownloadTask;

    #[test]
    fn staging_paths_are_unique_and_siblings_of_dest() {
        let dest = Path::new("/data/bin/alpha");
        let a = staging_path(dest);
        let b = staging_path(dest);
        assert_ne!(a, b);
        assert_eq!(a.parent(), dest.parent());
        assert!(a.to_string_lossy().ends_with(".part"));
    }

    #[test]
    fn invalid_path_tags_the_destination_name() {
        let dest = Path::new("/data/blob.bin");
        assert_eq!(invalid_path(dest), Path::new("/data/blob.bin.invalid"));
    }

    #[tokio::test]
    async fn file_hash_matching_accepts_both_algorithms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        tokio::fs::write(&path, b"payload bytes").await.unwrap();

        let sha1 = ExpectedHash::Sha1(hex::encode(Sha1::digest(b"payload bytes")));
        let sha256 = ExpectedHash::Sha256(hex::encode(Sha256::digest(b"payload bytes")));
        let wrong = ExpectedHash::Sha1(hex::encode(Sha1::digest(b"other bytes")));

        assert!(file_hash_matches(&path, &sha1).await.unwrap());
        assert!(file_hash_matches(&path, &sha256).await.unwrap());
        assert!(!file_hash_matches(&path, &wrong).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executable_bit_is_set_on_staging_and_survives_the_rename() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("launcher");
        let staging = staging_path(&dest);
        tokio::fs::write(&staging, b"#!/bin/sh\n").await.unwrap();

        mark_executable(&staging).await.unwrap();
        tokio::fs::rename(&staging, &dest).await.unwrap();

        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[tokio::test]
    async fn destination_currency_checks_hash_then_size() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cached");
        tokio::fs::write(&dest, b"cached content").await.unwrap();

        let by_hash = DownloadTask::new("http://example.invalid/c", &dest)
            .with_hash(ExpectedHash::Sha1(hex::encode(Sha1::digest(b"cached content"))));
        assert!(destination_is_current(&by_hash).await);

        let by_size = DownloadTask::new("http://example.invalid/c", &dest).with_size(14);
        assert!(destination_is_current(&by_size).await);

        let size_mismatch = DownloadTask::new("http://example.invalid/c", &dest).with_size(1);
        assert!(!destination_is_current(&size_mismatch).await);

        let no_expectations = DownloadTask::new("http://example.invalid/c", &dest);
        assert!(!destination_is_current(&no_expectations).await);
    }
}
