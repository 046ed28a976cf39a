//! Shared helpers for pipeline integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use corpus_ingest::descriptor::{ArchiveMethod, InputFormat};
use corpus_ingest::normalizer::MappingNormalizer;
use corpus_ingest::schema::{Field, Schema};
use corpus_ingest::{PipelineConfig, Source, SourceDescriptor};
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;
use zip::write::SimpleFileOptions;

/// Fast retries, small batches, everything under `data_dir`
pub fn test_config(data_dir: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .data_dir(data_dir)
        .max_attempts(3)
        .backoff(Duration::from_millis(5), Duration::from_millis(20))
        .request_timeout_secs(10)
        .batch_size(2)
        .build()
}

pub fn paper_schema() -> Schema {
    Schema::new(vec![
        Field::string("id"),
        Field::string("title"),
        Field::string("abstract"),
    ])
}

pub fn paper_normalizer() -> MappingNormalizer {
    MappingNormalizer::new("abstract", "id").with_metadata("title")
}

/// Fixed-list json lines source, optionally zipped
pub fn papers_source(urls: Vec<String>, archive: ArchiveMethod) -> Source {
    let descriptor = SourceDescriptor::builder("papers", InputFormat::JsonLines)
        .urls(urls)
        .archive(archive)
        .schema(paper_schema())
        .build()
        .unwrap();
    Source::new(descriptor, paper_normalizer())
}

/// Crawled json lines source
pub fn crawled_source(root: String, max_depth: Option<u32>) -> Source {
    let mut builder = SourceDescriptor::builder("crawled", InputFormat::JsonLines)
        .crawl([root], "*.jsonl")
        .schema(paper_schema());
    if let Some(depth) = max_depth {
        builder = builder.max_depth(depth);
    }
    Source::new(builder.build().unwrap(), paper_normalizer())
}

/// One json line per `(id, abstract)` pair
pub fn jsonl(records: &[(&str, &str)]) -> String {
    records
        .iter()
        .map(|(id, text)| {
            serde_json::json!({"id": id, "title": format!("Paper {}", id), "abstract": text})
                .to_string()
                + "\n"
        })
        .collect()
}

pub fn zip_bytes(members: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in members {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Minimal Apache-style index page
pub fn listing(entries: &[&str]) -> String {
    let links: String = entries
        .iter()
        .map(|e| format!("<a href=\"{0}\">{0}</a><br>\n", e))
        .collect();
    format!(
        "<html><body><a href=\"?C=N;O=D\">Name</a>\n<a href=\"../\">Parent Directory</a>\n{}</body></html>",
        links
    )
}
