// ─── Manifest Resolver ───
// Fetches and parses the remote runtime manifest: a mapping from platform
// key to the ordered list of files that make up one bundle.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AcquireError, AcquireResult};
use crate::http::build_http_client;
use crate::task::{DownloadTask, ExpectedHash};

/// How a finished file is treated on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    #[default]
    Regular,
    /// Gets the executable bit applied after a completed transfer (unix).
    Executable,
    SymlinkTarget,
}

/// A single file in the manifest, relative to the destination root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub kind: FileKind,
}

impl ManifestEntry {
    /// At most one hash algorithm per entry; enforced by `validate`.
    pub fn expected_hash(&self) -> Option<ExpectedHash> {
        if let Some(hex) = &self.sha1 {
            return Some(ExpectedHash::Sha1(hex.clone()));
        }
        self.sha256.clone().map(ExpectedHash::Sha256)
    }
}

/// Top-level manifest document: platform key → file entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeManifest {
    #[serde(flatten)]
    pub platforms: HashMap<String, Vec<ManifestEntry>>,
}

impl RuntimeManifest {
    /// Parse and structurally validate a manifest document.
    pub fn parse(text: &str) -> AcquireResult<Self> {
        let manifest: RuntimeManifest = serde_json::from_str(text)
            .map_err(|err| AcquireError::ManifestParse(err.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Entries for one platform, stable-sorted by relative path so that
    /// re-resolution of the same document is reproducible.
    pub fn entries_for(&self, platform: &str) -> AcquireResult<Vec<ManifestEntry>> {
        let Some(entries) = self.platforms.get(platform) else {
            return Err(AcquireError::UnsupportedPlatform {
                platform: platform.to_string(),
            });
        };
        let mut entries = entries.clone();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn validate(&self) -> AcquireResult<()> {
        for (platform, entries) in &self.platforms {
            let mut seen = HashSet::new();
            for entry in entries {
                if entry.url.is_empty() {
                    return Err(AcquireError::ManifestParse(format!(
                        "entry {:?} under platform {} has an empty url",
                        entry.path, platform
                    )));
                }
                if !is_safe_relative(&entry.path) {
                    return Err(AcquireError::ManifestParse(format!(
                        "entry path {:?} under platform {} escapes the destination root",
                        entry.path, platform
                    )));
                }
                if !seen.insert(entry.path.as_str()) {
                    return Err(AcquireError::ManifestParse(format!(
                        "duplicate entry path {:?} under platform {}",
                        entry.path, platform
                    )));
                }
                if entry.sha1.is_some() && entry.sha256.is_some() {
                    return Err(AcquireError::ManifestParse(format!(
                        "entry {:?} under platform {} carries both sha1 and sha256",
                        entry.path, platform
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Entry paths must stay inside the destination root: relative, no parent
/// components, no platform prefixes.
fn is_safe_relative(raw: &str) -> bool {
    if raw.is_empty() {
        return false;
    }
    let path = Path::new(raw);
    !path.is_absolute() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Fetches remote manifest documents and fans them out into tasks.
pub struct ManifestResolver {
    client: reqwest::Client,
}

impl ManifestResolver {
    pub fn new() -> AcquireResult<Self> {
        Ok(Self {
            client: build_http_client()?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Retrieve and parse a manifest document. Transport failures are fatal
    /// to the whole acquisition and are not retried here.
    pub async fn fetch(&self, url: &str) -> AcquireResult<RuntimeManifest> {
        info!("Fetching runtime manifest from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| AcquireError::ManifestFetch {
                url: url.to_string(),
                source,
            })?;
        let text = response
            .text()
            .await
            .map_err(|source| AcquireError::ManifestFetch {
                url: url.to_string(),
                source,
            })?;

        let manifest = RuntimeManifest::parse(&text)?;
        info!(
            "Manifest at {} lists {} platform(s)",
            url,
            manifest.platforms.len()
        );
        Ok(manifest)
    }

    /// Fetch a manifest and translate the entries for one platform 1:1
    /// into download tasks rooted at `root`.
    pub async fn resolve(
        &self,
        url: &str,
        platform: &str,
        root: &Path,
    ) -> AcquireResult<Vec<DownloadTask>> {
        let manifest = self.fetch(url).await?;
        let entries = manifest.entries_for(platform)?;
        Ok(entries
            .iter()
            .map(|entry| DownloadTask::from_entry(root, entry))
            .collect())
    }
}
