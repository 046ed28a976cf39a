//! Artifact downloads: idempotent, resumable, retried
//!
//! A download is reused without any network call when the file is on disk and
//! its `.meta.json` sidecar agrees with it. Otherwise the body is streamed into
//! `<file>.part` (resuming with a `Range` request when a partial file exists)
//! and renamed into place once complete.

use crate::artifact::{
    metadata_path, partial_path, Artifact, ArtifactState, DataLayout, DownloadMetadata, PathLocks,
    Stage,
};
use crate::config::PipelineConfig;
use crate::error::FetchError;
use crate::http::{ensure_fetchable, HttpClient};
use crate::retry::{classify_reqwest, classify_status};
use chrono::Utc;
use corpus_common::checksum::{compute_file_checksum, verify_file_checksum};
use corpus_common::types::{ByteCount, ChecksumAlgorithm};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// How a download attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Already complete on disk; no request was made
    Reused,
    Fetched { bytes: u64 },
    Failed,
    /// Aborted by cancellation; the artifact keeps its last completed state
    Cancelled,
}

/// Result of one successful HTTP transfer
#[derive(Debug)]
struct Completed {
    size: u64,
    etag: Option<String>,
    last_modified: Option<String>,
}

#[derive(Clone)]
pub struct Downloader {
    http: HttpClient,
    layout: DataLayout,
    filename: Option<String>,
    permits: Arc<Semaphore>,
    locks: Arc<PathLocks>,
    verify_checksums: bool,
}

impl Downloader {
    pub fn new(
        http: HttpClient,
        layout: DataLayout,
        filename: Option<String>,
        config: &PipelineConfig,
        locks: Arc<PathLocks>,
    ) -> Self {
        Self {
            http,
            layout,
            filename,
            permits: Arc::new(Semaphore::new(config.download_concurrency)),
            locks,
            verify_checksums: config.verify_checksums,
        }
    }

    pub fn local_path(&self, url: &Url) -> PathBuf {
        self.layout.download_path(url, self.filename.as_deref())
    }

    /// Bring the artifact to Downloaded or Failed
    pub async fn fetch(
        &self,
        mut artifact: Artifact,
        cancel: &CancellationToken,
    ) -> (Artifact, Transfer) {
        if let Err(e) = ensure_fetchable(&artifact.url) {
            warn!(url = %artifact.url, error = %e, "Artifact is not fetchable");
            return self.failed(artifact, e.to_string());
        }

        let path = self.local_path(&artifact.url);
        artifact.local_path = Some(path.clone());
        let _guard = self.locks.lock(&path).await;

        if let Some(meta) = self.reusable(&artifact.url, &path).await {
            debug!(url = %artifact.url, path = %path.display(), "Reusing completed download");
            artifact.size = Some(meta.size);
            artifact.etag = meta.etag;
            artifact.checksum = meta.sha256;
            return match artifact.advance(ArtifactState::Downloaded) {
                Ok(()) => (artifact, Transfer::Reused),
                Err(e) => self.failed(artifact, e.to_string()),
            };
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return (artifact, Transfer::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return (artifact, Transfer::Cancelled),
            },
        };
        if let Err(e) = artifact.advance(ArtifactState::Downloading) {
            return self.failed(artifact, e.to_string());
        }

        let url = artifact.url.clone();
        let (result, attempts) = self
            .http
            .retry_policy()
            .run(url.as_str(), cancel, |_| self.transfer(&url, &path, cancel))
            .await;
        artifact.record_attempts(attempts);

        let completed = match result {
            Ok(completed) => completed,
            Err(FetchError::Cancelled) => {
                info!(url = %url, "Download cancelled, partial file kept for resume");
                return (artifact, Transfer::Cancelled);
            },
            Err(e) => {
                warn!(url = %url, attempts, error = %e, "Download failed");
                return self.failed(artifact, e.to_string());
            },
        };

        let sha256 = if self.verify_checksums {
            match digest(&path).await {
                Ok(sum) => Some(sum),
                Err(e) => return self.failed(artifact, e),
            }
        } else {
            None
        };

        let meta = DownloadMetadata {
            url: url.to_string(),
            size: completed.size,
            etag: completed.etag.clone(),
            last_modified: completed.last_modified,
            sha256: sha256.clone(),
            completed_at: Utc::now(),
        };
        if let Err(e) = meta.store(&metadata_path(&path)).await {
            return self.failed(artifact, format!("cannot write download metadata: {}", e));
        }

        artifact.size = Some(completed.size);
        artifact.etag = completed.etag;
        artifact.checksum = sha256;
        info!(url = %url, size = %ByteCount(completed.size), attempts, "Downloaded artifact");

        match artifact.advance(ArtifactState::Downloaded) {
            Ok(()) => (
                artifact,
                Transfer::Fetched {
                    bytes: completed.size,
                },
            ),
            Err(e) => self.failed(artifact, e.to_string()),
        }
    }

    fn failed(&self, mut artifact: Artifact, cause: String) -> (Artifact, Transfer) {
        if let Err(e) = artifact.fail(Stage::Download, cause) {
            debug!(url = %artifact.url, error = %e, "Artifact already terminal");
        }
        (artifact, Transfer::Failed)
    }

    /// Sidecar present, for this URL, and agreeing with the file on disk
    async fn reusable(&self, url: &Url, path: &Path) -> Option<DownloadMetadata> {
        let meta = DownloadMetadata::load(&metadata_path(path)).await?;
        if meta.url != url.as_str() {
            return None;
        }

        let size = tokio::fs::metadata(path).await.ok()?.len();
        if size != meta.size {
            debug!(path = %path.display(), size, expected = meta.size, "Size differs from sidecar");
            return None;
        }

        if self.verify_checksums {
            if let Some(expected) = meta.sha256.clone() {
                let owned = path.to_path_buf();
                let verified = tokio::task::spawn_blocking(move || {
                    verify_file_checksum(&owned, &expected, ChecksumAlgorithm::Sha256)
                })
                .await
                .ok()?;
                if let Err(e) = verified {
                    warn!(path = %path.display(), error = %e, "Existing download failed verification");
                    return None;
                }
            }
        }

        Some(meta)
    }

    /// One HTTP attempt into the `.part` file
    async fn transfer(
        &self,
        url: &Url,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Completed, FetchError> {
        let part = partial_path(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(local_io)?;
        }

        let offset = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.http.client().get(url.clone());
        if offset > 0 {
            debug!(url = %url, offset, "Resuming partial download");
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response.map_err(|e| classify_reqwest(&e))?,
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            tokio::fs::remove_file(&part).await.map_err(local_io)?;
            return Err(FetchError::Transient("stale partial download discarded".to_string()));
        }
        if let Some(error) = classify_status(status) {
            return Err(error);
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let content_length = header(CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());

        let mut file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&part)
                .await
                .map_err(local_io)?
        } else {
            tokio::fs::File::create(&part).await.map_err(local_io)?
        };
        let mut written = if resumed { offset } else { 0 };

        let mut body = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(FetchError::Cancelled);
                },
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await.map_err(local_io)?;
                    written += bytes.len() as u64;
                },
                Some(Err(e)) => {
                    let _ = file.flush().await;
                    return Err(classify_reqwest(&e));
                },
                None => break,
            }
        }
        file.flush().await.map_err(local_io)?;
        drop(file);

        if let Some(length) = content_length {
            let expected = if resumed { offset + length } else { length };
            if written != expected {
                return Err(FetchError::Transient(format!(
                    "body truncated: {} of {} bytes",
                    written, expected
                )));
            }
        }

        tokio::fs::rename(&part, path).await.map_err(local_io)?;
        Ok(Completed {
            size: written,
            etag,
            last_modified,
        })
    }
}

fn local_io(e: std::io::Error) -> FetchError {
    FetchError::Permanent(format!("local I/O: {}", e))
}

async fn digest(path: &Path) -> Result<String, String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_file_checksum(&owned, ChecksumAlgorithm::Sha256))
        .await
        .map_err(|e| format!("checksum task failed: {}", e))?
        .map_err(|e| format!("checksum failed: {}", e))
}
