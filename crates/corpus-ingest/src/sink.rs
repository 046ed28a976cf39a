//! Destinations for the canonical record stream

use crate::error::Result;
use crate::record::CanonicalRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Consumer of canonical records
#[async_trait]
pub trait RecordSink: Send {
    async fn write(&mut self, record: CanonicalRecord) -> Result<()>;

    /// Flush anything buffered; called once after the last record
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes one JSON object per line. The file is written under a temporary
/// name and renamed on [`RecordSink::finish`], so an aborted run never leaves
/// a truncated output behind.
pub struct JsonLinesSink {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
    written: u64,
}

impl JsonLinesSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp_path = PathBuf::from(tmp);
        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(Self {
            path,
            tmp_path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write(&mut self, record: CanonicalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer.flush().await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct CollectSink {
    records: Vec<CanonicalRecord>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<CanonicalRecord> {
        self.records
    }
}

#[async_trait]
impl RecordSink for CollectSink {
    async fn write(&mut self, record: CanonicalRecord) -> Result<()> {
        self.records.push(record);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(id: &str) -> CanonicalRecord {
        CanonicalRecord {
            text: format!("text {}", id),
            identifier: id.to_string(),
            source: "test".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_json_lines_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/records.jsonl");

        let mut sink = JsonLinesSink::create(&path).await.unwrap();
        sink.write(record("1")).await.unwrap();
        sink.write(record("2")).await.unwrap();
        assert!(!path.exists());
        sink.finish().await.unwrap();

        assert_eq!(sink.written(), 2);
        let lines: Vec<CanonicalRecord> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![record("1"), record("2")]);
    }

    #[tokio::test]
    async fn test_collect_sink() {
        let mut sink = CollectSink::new();
        sink.write(record("a")).await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(sink.into_records().len(), 1);
    }
}
