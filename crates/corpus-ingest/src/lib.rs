//! Corpus Ingest Library
//!
//! Acquisition and normalization pipeline for large public text corpora.
//! Every source is a [`SourceDescriptor`] (what to fetch and how to parse it)
//! plus a [`Normalizer`] (how its fields map onto the canonical record).
//!
//! # Pipeline
//!
//! - **Resolver**: fixed URL lists or recursive crawls of html index pages
//! - **Downloader**: bounded, retried, resumable and idempotent transfers
//! - **Extractor**: zip, gzip and tar payloads, skipped when already on disk
//! - **Loader**: json, json lines, csv and row-tagged xml, checked against the
//!   declared schema
//! - **Normalizer**: source projection, then the canonical record invariants
//!
//! # Supported Sources
//!
//! - **arxiv**: the arXiv metadata snapshot
//! - **medline**: PubMed baseline and update files
//!
//! # Example
//!
//! ```no_run
//! use corpus_ingest::sink::JsonLinesSink;
//! use corpus_ingest::{sources, PipelineConfig, PipelineOrchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = sources::find("arxiv")?;
//!     let mut sink = JsonLinesSink::create("./out/arxiv.jsonl").await?;
//!     let report = PipelineOrchestrator::new(PipelineConfig::from_env()?)
//!         .run_to_sink(&source, &mut sink, CancellationToken::new())
//!         .await?;
//!     println!("{} records ({})", report.records_emitted, report.outcome());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod artifact;
pub mod config;
pub mod descriptor;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod http;
pub mod loader;
pub mod normalizer;
pub mod pipeline;
pub mod record;
pub mod resolver;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod sources;

pub use artifact::{Artifact, ArtifactState};
pub use config::PipelineConfig;
pub use descriptor::SourceDescriptor;
pub use error::{FetchError, IngestError, Result};
pub use normalizer::Normalizer;
pub use pipeline::{PipelineOrchestrator, RunHandle, RunOutcome, RunReport};
pub use record::CanonicalRecord;
pub use sources::Source;
