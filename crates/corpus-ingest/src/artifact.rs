//! Artifacts, their lifecycle, and where they live on disk

use crate::descriptor::InputFormat;
use crate::error::{IngestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use url::Url;

/// Lifecycle of one artifact. Variants are declared in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Pending,
    Downloading,
    Downloaded,
    Extracting,
    Extracted,
    Loaded,
    Normalized,
    Failed,
}

impl ArtifactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactState::Pending => "pending",
            ArtifactState::Downloading => "downloading",
            ArtifactState::Downloaded => "downloaded",
            ArtifactState::Extracting => "extracting",
            ArtifactState::Extracted => "extracted",
            ArtifactState::Loaded => "loaded",
            ArtifactState::Normalized => "normalized",
            ArtifactState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactState::Normalized | ArtifactState::Failed)
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage an artifact failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Extract,
    Load,
    Normalize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Load => "load",
            Stage::Normalize => "normalize",
        };
        f.write_str(name)
    }
}

/// Why an artifact ended up Failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFailure {
    pub url: String,
    pub stage: Stage,
    pub cause: String,
}

/// One remotely hosted file targeted for download. Identity is the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub url: Url,
    /// Assigned by the downloader on the first attempt
    pub local_path: Option<PathBuf>,
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub checksum: Option<String>,
    state: ArtifactState,
    attempts: u32,
    failure: Option<ArtifactFailure>,
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Artifact {}

impl Artifact {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            local_path: None,
            size: None,
            etag: None,
            checksum: None,
            state: ArtifactState::Pending,
            attempts: 0,
            failure: None,
        }
    }

    pub fn state(&self) -> ArtifactState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failure(&self) -> Option<&ArtifactFailure> {
        self.failure.as_ref()
    }

    pub(crate) fn record_attempts(&mut self, attempts: u32) {
        self.attempts += attempts;
    }

    /// Move strictly forward through the lifecycle
    pub fn advance(&mut self, to: ArtifactState) -> Result<()> {
        if to == ArtifactState::Failed || self.state == ArtifactState::Failed || to <= self.state {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Mark the artifact Failed from any non-terminal state
    pub fn fail(&mut self, stage: Stage, cause: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to: ArtifactState::Failed,
            });
        }
        self.state = ArtifactState::Failed;
        self.failure = Some(ArtifactFailure {
            url: self.url.to_string(),
            stage,
            cause: cause.into(),
        });
        Ok(())
    }

    /// Operator-triggered retry: Failed goes back to Pending
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.state != ArtifactState::Failed {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to: ArtifactState::Pending,
            });
        }
        self.state = ArtifactState::Pending;
        self.attempts = 0;
        self.failure = None;
        Ok(())
    }

    /// Last non-empty path segment of the URL
    pub fn file_name(&self) -> Option<&str> {
        self.url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
    }
}

/// Whether an extracted file still needs decompressing while it is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// A raw parseable file produced from one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFile {
    pub path: PathBuf,
    pub format: InputFormat,
    pub compression: Compression,
    pub artifact_url: String,
}

/// Sidecar written next to each completed download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub url: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub sha256: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl DownloadMetadata {
    pub async fn load(path: &Path) -> Option<Self> {
        let raw = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Write through a temporary file so a crash never leaves half a sidecar
    pub async fn store(&self, path: &Path) -> Result<()> {
        let tmp = with_suffix(path, ".tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Deterministic local paths for one source
#[derive(Debug, Clone)]
pub struct DataLayout {
    source_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: impl AsRef<Path>, source: &str) -> Self {
        Self {
            source_dir: data_dir.as_ref().join(sanitize_segment(source)),
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.source_dir.join("downloads")
    }

    /// `downloads/<host>/<url path>`, or `downloads/<filename>` when the
    /// descriptor names the local file
    pub fn download_path(&self, url: &Url, filename: Option<&str>) -> PathBuf {
        let base = self.downloads_dir();
        if let Some(name) = filename {
            return base.join(sanitize_segment(name));
        }

        let mut path = base.join(host_segment(url));
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        if segments.is_empty() {
            return path.join("index");
        }
        for segment in segments {
            path.push(sanitize_segment(segment));
        }
        path
    }

    pub fn extraction_dir(&self, download_path: &Path) -> PathBuf {
        let name = download_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        self.source_dir.join("extracted").join(name)
    }
}

pub fn partial_path(path: &Path) -> PathBuf {
    with_suffix(path, ".part")
}

pub fn metadata_path(path: &Path) -> PathBuf {
    with_suffix(path, ".meta.json")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn host_segment(url: &Url) -> String {
    let host = url.host_str().unwrap_or("local");
    match url.port() {
        Some(port) => sanitize_segment(&format!("{}_{}", host, port)),
        None => sanitize_segment(host),
    }
}

/// Keep path segments inside their parent directory
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Per-path async locks; no two tasks write the same local path at once
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    pub async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
