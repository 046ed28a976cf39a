//! Built-in corpus sources
//!
//! A [`Source`] pairs a descriptor (data) with its normalizer (the one piece of
//! source-specific logic). Sources are looked up by name; nothing here is a
//! class hierarchy.

pub mod arxiv;
pub mod medline;

use crate::descriptor::{DescriptorFile, SourceDescriptor};
use crate::error::{IngestError, Result};
use crate::normalizer::{MappingNormalizer, Normalizer};
use std::path::Path;
use std::sync::Arc;

/// A runnable source: what to fetch and how to project it
#[derive(Clone)]
pub struct Source {
    pub descriptor: SourceDescriptor,
    pub normalizer: Arc<dyn Normalizer>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Source {
    pub fn new(descriptor: SourceDescriptor, normalizer: impl Normalizer + 'static) -> Self {
        Self {
            descriptor,
            normalizer: Arc::new(normalizer),
        }
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Load a source from a TOML descriptor with a `[normalizer]` mapping
    pub async fn from_descriptor_file(path: &Path) -> Result<Self> {
        let (descriptor, mapping) = DescriptorFile::load(path).await?.into_descriptor()?;
        let mapping = mapping.ok_or_else(|| {
            IngestError::config(format!(
                "descriptor {} has no [normalizer] section",
                path.display()
            ))
        })?;
        Ok(Self::new(descriptor, MappingNormalizer::from_spec(mapping)))
    }
}

/// Every built-in source
pub fn builtin() -> Result<Vec<Source>> {
    Ok(vec![arxiv::source()?, medline::source()?])
}

/// Built-in source by name
pub fn find(name: &str) -> Result<Source> {
    match name {
        arxiv::NAME => arxiv::source(),
        medline::NAME => medline::source(),
        other => Err(IngestError::config(format!(
            "unknown source '{}' (built-in: {}, {})",
            other,
            arxiv::NAME,
            medline::NAME
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sources_are_valid() {
        let sources = builtin().unwrap();
        let names: Vec<&str> = sources.iter().map(Source::name).collect();
        assert_eq!(names, vec!["arxiv", "medline"]);
        for source in &sources {
            source.descriptor.validate().unwrap();
        }
    }

    #[test]
    fn test_find() {
        assert_eq!(find("medline").unwrap().name(), "medline");
        assert!(matches!(find("pmc"), Err(IngestError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_descriptor_file_without_normalizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.toml");
        std::fs::write(
            &path,
            "name = \"s\"\nurls = [\"http://example/a.json\"]\ninput_format = \"json\"\n\n[[schema]]\nname = \"id\"\ntype = \"string\"\n",
        )
        .unwrap();
        assert!(Source::from_descriptor_file(&path).await.is_err());
    }
}
