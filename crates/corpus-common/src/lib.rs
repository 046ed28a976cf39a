//! Corpus Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the corpus ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CorpusError`] and the [`Result`] alias
//! - **Checksums**: streaming file digests used to verify downloaded artifacts
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Types**: small value types shared across crates
//!
//! # Example
//!
//! ```no_run
//! use corpus_common::checksum::compute_file_checksum;
//! use corpus_common::types::ChecksumAlgorithm;
//! use corpus_common::Result;
//!
//! fn digest(path: &str) -> Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Sha256)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CorpusError, Result};
