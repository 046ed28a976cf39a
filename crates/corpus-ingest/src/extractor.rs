//! Turns downloaded artifacts into raw parseable files
//!
//! # Supported Formats
//!
//! - **Zip** (.zip): members streamed to disk through `zip`
//! - **Gzip** (.gz): decompressed to a file with `flate2`, or left compressed
//!   and decoded by the loader ([`ArchiveMethod::GzipStream`])
//! - **Tar** / **Tar.gz**: unpacked with `tar`
//!
//! Each extraction directory gets a `.extracted.json` manifest once every
//! member is on disk; a later run that finds a manifest matching the download
//! skips the work.

use crate::artifact::{
    Artifact, ArtifactState, Compression, DataLayout, ExtractedFile, PathLocks, Stage,
};
use crate::descriptor::{ArchiveMethod, InputFormat};
use crate::error::{IngestError, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MANIFEST_NAME: &str = ".extracted.json";

/// Files produced for one artifact
#[derive(Debug, Clone)]
pub struct Extraction {
    pub files: Vec<ExtractedFile>,
    /// Found complete on disk from an earlier run
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtractionManifest {
    artifact_url: String,
    archive: ArchiveMethod,
    download_size: Option<u64>,
    members: Vec<PathBuf>,
    completed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Extractor {
    layout: DataLayout,
    archive: ArchiveMethod,
    format: InputFormat,
    extracted_filename: Option<String>,
    locks: Arc<PathLocks>,
}

impl Extractor {
    pub fn new(
        layout: DataLayout,
        archive: ArchiveMethod,
        format: InputFormat,
        extracted_filename: Option<String>,
        locks: Arc<PathLocks>,
    ) -> Self {
        Self {
            layout,
            archive,
            format,
            extracted_filename,
            locks,
        }
    }

    /// Extract a Downloaded artifact. A corrupt archive marks it Failed.
    pub async fn extract(&self, artifact: &mut Artifact) -> Option<Extraction> {
        match self.try_extract(artifact).await {
            Ok(extraction) => Some(extraction),
            Err(e) => {
                warn!(url = %artifact.url, error = %e, "Extraction failed");
                if let Err(e) = artifact.fail(Stage::Extract, e.to_string()) {
                    debug!(error = %e, "Artifact already terminal");
                }
                None
            },
        }
    }

    async fn try_extract(&self, artifact: &mut Artifact) -> Result<Extraction> {
        let download = artifact.local_path.clone().ok_or_else(|| IngestError::Extraction {
            path: PathBuf::new(),
            reason: format!("{} has no local file", artifact.url),
        })?;
        artifact.advance(ArtifactState::Extracting)?;

        let (compression, direct) = match self.archive {
            ArchiveMethod::None => (Compression::None, true),
            ArchiveMethod::GzipStream => (Compression::Gzip, true),
            _ => (Compression::None, false),
        };
        if direct {
            artifact.advance(ArtifactState::Extracted)?;
            return Ok(Extraction {
                files: vec![self.extracted_file(download, compression, artifact)],
                reused: false,
            });
        }

        let dir = self.layout.extraction_dir(&download);
        let _guard = self.locks.lock(&dir).await;

        let (members, reused) = match self.completed_members(&dir, artifact).await {
            Some(members) => {
                debug!(url = %artifact.url, dir = %dir.display(), "Extraction already complete");
                (members, true)
            },
            None => {
                let members = self.unpack(artifact, &download, &dir).await?;
                info!(url = %artifact.url, members = members.len(), dir = %dir.display(), "Extracted artifact");
                (members, false)
            },
        };

        let files = self.select_members(&dir, members, &download, artifact)?;
        artifact.advance(ArtifactState::Extracted)?;
        Ok(Extraction { files, reused })
    }

    /// Members of an earlier extraction, if it finished for this same download.
    ///
    /// Only the manifest counts: it is written after the last member is renamed
    /// into place, so a member file without one may be truncated.
    async fn completed_members(&self, dir: &Path, artifact: &Artifact) -> Option<Vec<PathBuf>> {
        let raw = tokio::fs::read(dir.join(MANIFEST_NAME)).await.ok()?;
        let manifest: ExtractionManifest = serde_json::from_slice(&raw).ok()?;
        if manifest.artifact_url != artifact.url.as_str() || manifest.download_size != artifact.size {
            return None;
        }
        for member in &manifest.members {
            if !tokio::fs::try_exists(dir.join(member)).await.unwrap_or(false) {
                return None;
            }
        }
        Some(manifest.members)
    }

    async fn unpack(&self, artifact: &Artifact, archive: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
        let method = self.archive;
        let manifest = ExtractionManifest {
            artifact_url: artifact.url.to_string(),
            archive: method,
            download_size: artifact.size,
            members: Vec::new(),
            completed_at: Utc::now(),
        };
        let archive_path = archive.to_path_buf();
        let dir = dir.to_path_buf();

        let task = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<PathBuf>> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let members = unpack_archive(method, &archive_path, &dir)?;
            let manifest = ExtractionManifest {
                members: members.clone(),
                completed_at: Utc::now(),
                ..manifest
            };
            let tmp = dir.join(format!("{}.tmp", MANIFEST_NAME));
            std::fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)?;
            std::fs::rename(&tmp, dir.join(MANIFEST_NAME))?;
            Ok(members)
        });

        task.await
            .map_err(|e| IngestError::Extraction {
                path: archive.to_path_buf(),
                reason: format!("extraction task failed: {}", e),
            })?
            .map_err(|e| IngestError::Extraction {
                path: archive.to_path_buf(),
                reason: format!("{:#}", e),
            })
    }

    fn select_members(
        &self,
        dir: &Path,
        members: Vec<PathBuf>,
        archive: &Path,
        artifact: &Artifact,
    ) -> Result<Vec<ExtractedFile>> {
        let selected: Vec<PathBuf> = match self.extracted_filename.as_deref() {
            Some(expected) => {
                let wanted = Path::new(expected);
                let found = members
                    .into_iter()
                    .find(|m| m == wanted || m.file_name() == wanted.file_name());
                match found {
                    Some(member) => vec![member],
                    None => {
                        return Err(IngestError::Extraction {
                            path: archive.to_path_buf(),
                            reason: format!("expected member '{}' not in archive", expected),
                        })
                    },
                }
            },
            None => members.into_iter().filter(|m| !is_hidden(m)).collect(),
        };

        Ok(selected
            .into_iter()
            .map(|member| self.extracted_file(dir.join(member), Compression::None, artifact))
            .collect())
    }

    fn extracted_file(&self, path: PathBuf, compression: Compression, artifact: &Artifact) -> ExtractedFile {
        ExtractedFile {
            path,
            format: self.format,
            compression,
            artifact_url: artifact.url.to_string(),
        }
    }
}

fn is_hidden(member: &Path) -> bool {
    member.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name.starts_with('.') || name == "__MACOSX"
    })
}

/// Unpack `archive` into `dir`, returning member paths relative to `dir`
fn unpack_archive(method: ArchiveMethod, archive: &Path, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let reader = BufReader::new(file);

    match method {
        ArchiveMethod::Zip => unpack_zip(reader, dir),
        ArchiveMethod::Gunzip => {
            let name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = name
                .strip_suffix(".gz")
                .or_else(|| name.strip_suffix(".gzip"))
                .unwrap_or(&name);
            let member = PathBuf::from(if stem.is_empty() { "payload" } else { stem });
            write_member(&dir.join(&member), &mut MultiGzDecoder::new(reader))
                .context("Failed to decompress gzip data")?;
            Ok(vec![member])
        },
        ArchiveMethod::TarGz => unpack_tar(tar::Archive::new(MultiGzDecoder::new(reader)), dir),
        ArchiveMethod::Tar => unpack_tar(tar::Archive::new(reader), dir),
        ArchiveMethod::None | ArchiveMethod::GzipStream => {
            anyhow::bail!("{:?} archives are read in place", method)
        },
    }
}

fn unpack_zip(reader: BufReader<File>, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut archive = zip::ZipArchive::new(reader).context("Failed to read zip archive")?;
    let mut members = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry at index {}", i))?;

        let Some(name) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping zip entry escaping the extraction directory");
            continue;
        };
        let target = dir.join(&name);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = write_member(&target, &mut entry)
            .with_context(|| format!("Failed to read zip entry: {}", name.display()))?;
        debug!("Extracted {} ({} bytes)", name.display(), bytes);
        members.push(name);
    }

    Ok(members)
}

/// Stream `reader` into `<target>.tmp`, then rename it over `target`
fn write_member(target: &Path, reader: &mut impl std::io::Read) -> anyhow::Result<u64> {
    let mut tmp_name = target.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut out = File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
    let bytes = std::io::copy(reader, &mut out)?;
    out.sync_all()?;
    drop(out);
    std::fs::rename(&tmp, target)?;
    Ok(bytes)
}

fn unpack_tar<R: std::io::Read>(mut archive: tar::Archive<R>, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut members = Vec::new();

    for entry in archive.entries().context("Failed to read tar entries")? {
        let mut entry = entry.context("Failed to read tar entry")?;
        let path = entry.path().context("Failed to get entry path")?.into_owned();
        let is_file = entry.header().entry_type().is_file();

        let unpacked = entry
            .unpack_in(dir)
            .with_context(|| format!("Failed to unpack tar entry: {}", path.display()))?;
        if !unpacked {
            warn!(entry = %path.display(), "Skipping tar entry escaping the extraction directory");
            continue;
        }
        if is_file {
            members.push(path);
        }
    }

    Ok(members)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use url::Url;
    use zip::write::SimpleFileOptions;

    fn downloaded(path: &Path) -> Artifact {
        let mut artifact = Artifact::new(Url::parse("http://example/a.zip").unwrap());
        artifact.local_path = Some(path.to_path_buf());
        artifact.size = Some(std::fs::metadata(path).unwrap().len());
        artifact.advance(ArtifactState::Downloaded).unwrap();
        artifact
    }

    fn extractor(data_dir: &Path, method: ArchiveMethod, expected: Option<&str>) -> Extractor {
        Extractor::new(
            DataLayout::new(data_dir, "test"),
            method,
            InputFormat::JsonLines,
            expected.map(str::to_string),
            Arc::new(PathLocks::default()),
        )
    }

    fn write_zip(path: &Path, members: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in members {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_zip_extraction_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(&archive, &[("data/a.jsonl", "{}\n"), (".DS_Store", "x")]);
        let extractor = extractor(dir.path(), ArchiveMethod::Zip, None);

        let mut artifact = downloaded(&archive);
        let first = extractor.extract(&mut artifact).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.files.len(), 1);
        assert!(first.files[0].path.ends_with("data/a.jsonl"));
        assert_eq!(artifact.state(), ArtifactState::Extracted);

        let mut again = downloaded(&archive);
        let second = extractor.extract(&mut again).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.files, first.files);
    }

    #[tokio::test]
    async fn test_expected_member_is_selected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(&archive, &[("snapshot.json", "{}"), ("other.json", "{}")]);

        let mut artifact = downloaded(&archive);
        let out = extractor(dir.path(), ArchiveMethod::Zip, Some("snapshot.json"))
            .extract(&mut artifact)
            .await
            .unwrap();
        assert_eq!(out.files.len(), 1);
        assert!(out.files[0].path.ends_with("snapshot.json"));

        let mut missing = downloaded(&archive);
        let result = extractor(dir.path(), ArchiveMethod::Zip, Some("absent.json"))
            .extract(&mut missing)
            .await;
        assert!(result.is_none());
        assert_eq!(missing.state(), ArtifactState::Failed);
    }

    #[tokio::test]
    async fn test_member_without_manifest_is_extracted_again() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        let body = "{\"id\":1}\n{\"id\":2}\n";
        write_zip(&archive, &[("snapshot.json", body)]);
        let extractor = extractor(dir.path(), ArchiveMethod::Zip, Some("snapshot.json"));

        // An interrupted earlier run left a truncated member and no manifest
        let target_dir = DataLayout::new(dir.path(), "test").extraction_dir(&archive);
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("snapshot.json"), "{\"id\":1}\n{\"i").unwrap();

        let mut artifact = downloaded(&archive);
        let out = extractor.extract(&mut artifact).await.unwrap();
        assert!(!out.reused);
        assert_eq!(std::fs::read_to_string(&out.files[0].path).unwrap(), body);
        assert!(target_dir.join(MANIFEST_NAME).exists());
        assert!(!target_dir.join("snapshot.json.tmp").exists());

        let mut again = downloaded(&archive);
        assert!(extractor.extract(&mut again).await.unwrap().reused);
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"this is not a zip file").unwrap();

        let mut artifact = downloaded(&archive);
        assert!(extractor(dir.path(), ArchiveMethod::Zip, None)
            .extract(&mut artifact)
            .await
            .is_none());
        assert_eq!(artifact.state(), ArtifactState::Failed);
        assert_eq!(artifact.failure().unwrap().stage, Stage::Extract);
    }

    #[tokio::test]
    async fn test_gunzip_and_stream_modes() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("records.jsonl.gz");
        let mut encoder = GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::default());
        encoder.write_all(b"{\"id\":1}\n").unwrap();
        encoder.finish().unwrap();

        let mut artifact = downloaded(&archive);
        let out = extractor(dir.path(), ArchiveMethod::Gunzip, None)
            .extract(&mut artifact)
            .await
            .unwrap();
        assert!(out.files[0].path.ends_with("records.jsonl"));
        assert_eq!(std::fs::read_to_string(&out.files[0].path).unwrap(), "{\"id\":1}\n");

        let mut streamed = downloaded(&archive);
        let out = extractor(dir.path(), ArchiveMethod::GzipStream, None)
            .extract(&mut streamed)
            .await
            .unwrap();
        assert_eq!(out.files[0].path, archive);
        assert_eq!(out.files[0].compression, Compression::Gzip);
    }

    #[tokio::test]
    async fn test_tar_gz_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        {
            let encoder = GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let body = b"id\n1\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "part/one.csv", &body[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let mut artifact = downloaded(&archive);
        let out = extractor(dir.path(), ArchiveMethod::TarGz, None)
            .extract(&mut artifact)
            .await
            .unwrap();
        assert_eq!(out.files.len(), 1);
        assert_eq!(std::fs::read_to_string(&out.files[0].path).unwrap(), "id\n1\n");
    }
}
