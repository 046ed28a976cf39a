//! Structured loading of extracted files
//!
//! [`StructuredLoader`] is the boundary to the record-parsing engine: given a
//! file, its format tag and the declared schema it yields a lazy, finite
//! sequence of [`StructuredRecord`]s. [`NativeLoader`] is the built-in engine.
//!
//! Parse failures surface as [`IngestError::Load`]; a record whose shape does
//! not fit the schema surfaces as [`IngestError::StructuralMismatch`]. Either
//! way the caller skips the rest of the file.

mod delimited;
mod json;
mod xml;

use crate::artifact::{Compression, ExtractedFile};
use crate::descriptor::{InputFormat, SourceDescriptor};
use crate::error::{IngestError, Result};
use crate::record::StructuredRecord;
use crate::schema::{flatten_record, Schema};
use flate2::read::MultiGzDecoder;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub use self::xml::{DEFAULT_ATTRIBUTE_PREFIX, DEFAULT_VALUE_TAG};

const READ_BUFFER: usize = 256 * 1024;

/// Lazy record sequence for one file
pub type RecordIter = Box<dyn Iterator<Item = Result<StructuredRecord>> + Send>;

/// Raw rows before schema conformance; errors are parse failure descriptions
type RawRows = Box<dyn Iterator<Item = std::result::Result<Map<String, Value>, String>> + Send>;

/// What a loader needs to know about a source
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub format: InputFormat,
    pub schema: Schema,
    pub options: BTreeMap<String, String>,
    pub flatten: bool,
}

impl LoadSpec {
    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Self {
        Self {
            format: descriptor.input_format(),
            schema: descriptor.schema().clone(),
            options: descriptor.input_options().clone(),
            flatten: descriptor.flatten(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Replaceable record-parsing engine. Implementations block; callers run them
/// on the blocking pool.
pub trait StructuredLoader: Send + Sync {
    fn load(&self, file: &ExtractedFile, spec: &LoadSpec) -> Result<RecordIter>;
}

/// Built-in engine for json, json lines, csv and row-tagged xml
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLoader;

impl StructuredLoader for NativeLoader {
    fn load(&self, file: &ExtractedFile, spec: &LoadSpec) -> Result<RecordIter> {
        let reader = open(&file.path, file.compression)?;
        let rows: RawRows = match spec.format {
            InputFormat::Json => json::values(reader),
            InputFormat::JsonLines => json::lines(reader),
            InputFormat::Csv => delimited::rows(reader, spec).map_err(|reason| IngestError::Load {
                path: file.path.clone(),
                reason,
            })?,
            InputFormat::Xml => xml::rows(reader, spec)?,
        };

        Ok(Box::new(Conform {
            rows,
            path: file.path.clone(),
            schema: spec.schema.clone(),
            flatten: spec.flatten,
            failed: false,
        }))
    }
}

/// Open a file for buffered reading, decoding gzip on the fly when asked
fn open(path: &Path, compression: Compression) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).map_err(|e| IngestError::Load {
        path: path.to_path_buf(),
        reason: format!("cannot open: {}", e),
    })?;
    let buffered = BufReader::with_capacity(READ_BUFFER, file);

    Ok(match compression {
        Compression::None => Box::new(buffered),
        Compression::Gzip => Box::new(BufReader::with_capacity(
            READ_BUFFER,
            MultiGzDecoder::new(buffered),
        )),
    })
}

/// Applies the schema (and flattening) to raw rows; stops after the first error
struct Conform {
    rows: RawRows,
    path: PathBuf,
    schema: Schema,
    flatten: bool,
    failed: bool,
}

impl Iterator for Conform {
    type Item = Result<StructuredRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let item = match self.rows.next()? {
            Ok(raw) => self
                .schema
                .conform(raw)
                .map(|fields| {
                    let fields = if self.flatten { flatten_record(fields) } else { fields };
                    StructuredRecord::new(fields)
                })
                .map_err(|reason| IngestError::StructuralMismatch {
                    path: self.path.clone(),
                    reason,
                }),
            Err(reason) => Err(IngestError::Load {
                path: self.path.clone(),
                reason,
            }),
        };

        self.failed = item.is_err();
        Some(item)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn extracted(path: &Path, format: InputFormat, compression: Compression) -> ExtractedFile {
        ExtractedFile {
            path: path.to_path_buf(),
            format,
            compression,
            artifact_url: "http://example/a".to_string(),
        }
    }

    fn spec(format: InputFormat, schema: Schema) -> LoadSpec {
        LoadSpec {
            format,
            schema,
            options: BTreeMap::new(),
            flatten: false,
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Field::string("id").not_null(),
            Field::string("abstract"),
            Field::new("year", FieldType::Integer),
        ])
    }

    #[test]
    fn test_jsonl_conforms_to_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"1\",\"abstract\":\"a\",\"year\":\"2020\",\"extra\":true}\n{\"id\":\"2\"}\n",
        )
        .unwrap();

        let records: Vec<StructuredRecord> = NativeLoader
            .load(&extracted(&path, InputFormat::JsonLines, Compression::None), &spec(InputFormat::JsonLines, schema()))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("year"), Some(&Value::from(2020)));
        assert!(records[0].get("extra").is_none());
        assert_eq!(records[1].get("abstract"), Some(&Value::Null));
    }

    #[test]
    fn test_structural_mismatch_stops_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\":\"1\",\"year\":\"soon\"}\n{\"id\":\"2\"}\n").unwrap();

        let mut iter = NativeLoader
            .load(&extracted(&path, InputFormat::JsonLines, Compression::None), &spec(InputFormat::JsonLines, schema()))
            .unwrap();
        assert!(matches!(iter.next(), Some(Err(IngestError::StructuralMismatch { .. }))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_gzip_stream_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        encoder
            .write_all(br#"[{"id":"1","abstract":"x"},{"id":"2","abstract":"y"}]"#)
            .unwrap();
        encoder.finish().unwrap();

        let count = NativeLoader
            .load(&extracted(&path, InputFormat::Json, Compression::Gzip), &spec(InputFormat::Json, schema()))
            .unwrap()
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let result = NativeLoader.load(
            &extracted(Path::new("/nonexistent/a.json"), InputFormat::Json, Compression::None),
            &spec(InputFormat::Json, schema()),
        );
        assert!(matches!(result, Err(IngestError::Load { .. })));
    }
}
