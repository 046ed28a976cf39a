//! Source descriptors: the static acquisition and parsing contract of a corpus
//!
//! A descriptor is data only. It is built once (in code or from a TOML file),
//! validated, and never mutated afterwards.

use crate::error::{IngestError, Result};
use crate::normalizer::MappingSpec;
use crate::schema::Schema;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// How a source's artifacts are discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Acquisition {
    FixedList {
        urls: Vec<Url>,
    },
    RecursiveCrawl {
        roots: Vec<Url>,
        /// Glob matched against the file name of each listing entry
        match_condition: String,
        max_depth: Option<u32>,
    },
}

/// Archive handling for downloaded artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMethod {
    #[default]
    None,
    Zip,
    /// Decompress to a sibling file on disk
    Gunzip,
    /// Keep the `.gz`; the loader decompresses while reading
    GzipStream,
    TarGz,
    Tar,
}

impl std::str::FromStr for ArchiveMethod {
    type Err = IngestError;

    /// Accepts method names and the shell commands sources historically declared
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        match normalized.as_str() {
            "" | "none" => Ok(ArchiveMethod::None),
            "zip" | "unzip" => Ok(ArchiveMethod::Zip),
            "gunzip" | "gzip -d" => Ok(ArchiveMethod::Gunzip),
            "gzip_stream" | "gzip-stream" | "zcat" | "gzip -dc" => Ok(ArchiveMethod::GzipStream),
            "tar_gz" | "tar.gz" | "tgz" | "tar -xzf" | "tar xzf" | "tar -zxf" => {
                Ok(ArchiveMethod::TarGz)
            },
            "tar" | "tar -xf" | "tar xf" => Ok(ArchiveMethod::Tar),
            _ => Err(IngestError::config(format!("unknown extract command '{}'", s))),
        }
    }
}

/// Physical format of extracted files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// Line-delimited or concatenated JSON values, or a single top-level array
    Json,
    JsonLines,
    Csv,
    Xml,
}

impl std::str::FromStr for InputFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(InputFormat::Json),
            "jsonl" | "jsonlines" | "json-lines" | "ndjson" => Ok(InputFormat::JsonLines),
            "csv" => Ok(InputFormat::Csv),
            "xml" | "com.databricks.spark.xml" => Ok(InputFormat::Xml),
            _ => Err(IngestError::config(format!("unknown input format '{}'", s))),
        }
    }
}

impl std::fmt::Display for InputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            InputFormat::Json => "json",
            InputFormat::JsonLines => "jsonl",
            InputFormat::Csv => "csv",
            InputFormat::Xml => "xml",
        };
        f.write_str(tag)
    }
}

/// Static declaration of one corpus
#[derive(Debug, Clone, Serialize)]
pub struct SourceDescriptor {
    name: String,
    acquisition: Acquisition,
    mini_urls: Vec<Url>,
    filename: Option<String>,
    archive: ArchiveMethod,
    extracted_filename: Option<String>,
    input_format: InputFormat,
    input_options: BTreeMap<String, String>,
    schema: Schema,
    flatten: bool,
}

impl SourceDescriptor {
    pub fn builder(name: impl Into<String>, input_format: InputFormat) -> DescriptorBuilder {
        DescriptorBuilder::new(name.into(), input_format)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    pub fn mini_urls(&self) -> &[Url] {
        &self.mini_urls
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn archive(&self) -> ArchiveMethod {
        self.archive
    }

    pub fn extracted_filename(&self) -> Option<&str> {
        self.extracted_filename.as_deref()
    }

    pub fn input_format(&self) -> InputFormat {
        self.input_format
    }

    pub fn input_options(&self) -> &BTreeMap<String, String> {
        &self.input_options
    }

    pub fn input_option(&self, key: &str) -> Option<&str> {
        self.input_options.get(key).map(String::as_str)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn flatten(&self) -> bool {
        self.flatten
    }

    /// The acquisition to run; mini mode swaps in the fixed `mini_urls` subset
    pub fn effective_acquisition(&self, mini_pipeline: bool) -> Acquisition {
        if mini_pipeline && !self.mini_urls.is_empty() {
            Acquisition::FixedList {
                urls: self.mini_urls.clone(),
            }
        } else {
            self.acquisition.clone()
        }
    }

    /// Compiled file glob for recursive sources
    pub fn file_matcher(&self) -> Result<Option<GlobMatcher>> {
        match &self.acquisition {
            Acquisition::RecursiveCrawl {
                match_condition, ..
            } => compile_glob(match_condition).map(Some),
            Acquisition::FixedList { .. } => Ok(None),
        }
    }

    /// Configuration checks run before any network I/O
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(IngestError::config(format!(
                "source name '{}' must be non-empty and use [A-Za-z0-9_-]",
                self.name
            )));
        }

        match &self.acquisition {
            Acquisition::FixedList { urls } => {
                if urls.is_empty() {
                    return Err(IngestError::config(format!("source '{}' lists no urls", self.name)));
                }
                if self.filename.is_some() && urls.len() > 1 {
                    return Err(IngestError::config(format!(
                        "source '{}' sets filename but lists {} urls",
                        self.name,
                        urls.len()
                    )));
                }
            },
            Acquisition::RecursiveCrawl {
                roots,
                match_condition,
                max_depth,
            } => {
                if roots.is_empty() {
                    return Err(IngestError::config(format!(
                        "source '{}' has no crawl roots",
                        self.name
                    )));
                }
                compile_glob(match_condition)?;
                if *max_depth == Some(0) {
                    return Err(IngestError::config("max_depth must be at least 1"));
                }
                if self.filename.is_some() {
                    return Err(IngestError::config(format!(
                        "source '{}' is crawled; filename only applies to a single fixed url",
                        self.name
                    )));
                }
            },
        }

        if self.input_format == InputFormat::Xml && self.input_option("rowTag").is_none() {
            return Err(IngestError::config(format!(
                "xml source '{}' must set input_options.rowTag",
                self.name
            )));
        }

        self.schema.validate(self.flatten)
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    if pattern.trim().is_empty() {
        return Err(IngestError::config("match_condition must not be empty"));
    }
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| IngestError::config(format!("invalid match_condition '{}': {}", pattern, e)))
}

fn parse_urls(raw: &[String], key: &str) -> Result<Vec<Url>> {
    raw.iter()
        .map(|u| {
            Url::parse(u).map_err(|e| IngestError::config(format!("invalid url in {}: '{}': {}", key, u, e)))
        })
        .collect()
}

/// Crawl roots are directories: `.../baseline` is listed as `.../baseline/`
/// so relative links on its index page resolve beneath it
fn parse_crawl_roots(raw: &[String]) -> Result<Vec<Url>> {
    let mut roots = parse_urls(raw, "crawl_roots")?;
    for root in &mut roots {
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
    }
    Ok(roots)
}

/// Builder for SourceDescriptor; `build()` validates
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    name: String,
    urls: Vec<String>,
    crawl: Option<(Vec<String>, String, Option<u32>)>,
    mini_urls: Vec<String>,
    filename: Option<String>,
    archive: ArchiveMethod,
    extracted_filename: Option<String>,
    input_format: InputFormat,
    input_options: BTreeMap<String, String>,
    schema: Schema,
    flatten: bool,
}

impl DescriptorBuilder {
    fn new(name: String, input_format: InputFormat) -> Self {
        Self {
            name,
            urls: Vec::new(),
            crawl: None,
            mini_urls: Vec::new(),
            filename: None,
            archive: ArchiveMethod::None,
            extracted_filename: None,
            input_format,
            input_options: BTreeMap::new(),
            schema: Schema::default(),
            flatten: false,
        }
    }

    pub fn urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn crawl<I, S>(mut self, roots: I, match_condition: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let depth = self.crawl.as_ref().and_then(|c| c.2);
        self.crawl = Some((
            roots.into_iter().map(Into::into).collect(),
            match_condition.into(),
            depth,
        ));
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        if let Some(crawl) = self.crawl.as_mut() {
            crawl.2 = Some(depth);
        }
        self
    }

    pub fn mini_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mini_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    pub fn archive(mut self, method: ArchiveMethod) -> Self {
        self.archive = method;
        self
    }

    pub fn extracted_filename(mut self, name: impl Into<String>) -> Self {
        self.extracted_filename = Some(name.into());
        self
    }

    pub fn input_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.input_options.insert(key.into(), value.into());
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn flatten(mut self, flatten: bool) -> Self {
        self.flatten = flatten;
        self
    }

    pub fn build(self) -> Result<SourceDescriptor> {
        let acquisition = match (self.crawl, self.urls.is_empty()) {
            (Some(_), false) => {
                return Err(IngestError::config(format!(
                    "source '{}' sets both urls and crawl_roots",
                    self.name
                )))
            },
            (Some((roots, match_condition, max_depth)), true) => Acquisition::RecursiveCrawl {
                roots: parse_crawl_roots(&roots)?,
                match_condition,
                max_depth,
            },
            (None, _) => Acquisition::FixedList {
                urls: parse_urls(&self.urls, "urls")?,
            },
        };

        let descriptor = SourceDescriptor {
            name: self.name,
            acquisition,
            mini_urls: parse_urls(&self.mini_urls, "mini_urls")?,
            filename: self.filename,
            archive: self.archive,
            extracted_filename: self.extracted_filename,
            input_format: self.input_format,
            input_options: self.input_options,
            schema: self.schema,
            flatten: self.flatten,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// On-disk TOML form of a descriptor, using the historical configuration keys
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorFile {
    pub name: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub crawl_roots: Vec<String>,
    pub match_condition: Option<String>,
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub mini_urls: Vec<String>,
    pub filename: Option<String>,
    pub extract_command: Option<String>,
    pub extracted_filename: Option<String>,
    pub input_format: String,
    #[serde(default)]
    pub input_options: BTreeMap<String, String>,
    pub schema: Schema,
    #[serde(default, alias = "flatten")]
    pub flattern: bool,
    pub normalizer: Option<MappingSpec>,
}

impl DescriptorFile {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| IngestError::config(format!("invalid descriptor: {}", e)))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            IngestError::config(format!("cannot read descriptor {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn into_descriptor(self) -> Result<(SourceDescriptor, Option<MappingSpec>)> {
        let input_format: InputFormat = self.input_format.parse()?;
        let mut builder = SourceDescriptor::builder(self.name, input_format)
            .urls(self.urls)
            .mini_urls(self.mini_urls)
            .schema(self.schema)
            .flatten(self.flattern);

        if !self.crawl_roots.is_empty() {
            let pattern = self.match_condition.ok_or_else(|| {
                IngestError::config("crawl_roots requires a match_condition glob")
            })?;
            builder = builder.crawl(self.crawl_roots, pattern);
            if let Some(depth) = self.max_depth {
                builder = builder.max_depth(depth);
            }
        }
        if let Some(filename) = self.filename {
            builder = builder.filename(filename);
        }
        if let Some(command) = self.extract_command {
            builder = builder.archive(command.parse()?);
        }
        if let Some(extracted) = self.extracted_filename {
            builder = builder.extracted_filename(extracted);
        }
        for (key, value) in self.input_options {
            builder = builder.input_option(key, value);
        }

        Ok((builder.build()?, self.normalizer))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::Field;

    fn schema() -> Schema {
        Schema::new(vec![Field::string("id"), Field::string("abstract")])
    }

    #[test]
    fn test_parse_archive_methods() {
        assert_eq!("unzip".parse::<ArchiveMethod>().unwrap(), ArchiveMethod::Zip);
        assert_eq!("tar  -xzf".parse::<ArchiveMethod>().unwrap(), ArchiveMethod::TarGz);
        assert_eq!("zcat".parse::<ArchiveMethod>().unwrap(), ArchiveMethod::GzipStream);
        assert!("7z x".parse::<ArchiveMethod>().is_err());
    }

    #[test]
    fn test_parse_input_formats() {
        assert_eq!("com.databricks.spark.xml".parse::<InputFormat>().unwrap(), InputFormat::Xml);
        assert_eq!("NDJSON".parse::<InputFormat>().unwrap(), InputFormat::JsonLines);
        assert!(matches!(
            "parquet".parse::<InputFormat>(),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn test_fixed_list_descriptor() {
        let descriptor = SourceDescriptor::builder("papers", InputFormat::JsonLines)
            .urls(["http://example/a.zip"])
            .archive(ArchiveMethod::Zip)
            .schema(schema())
            .build()
            .unwrap();

        assert!(matches!(descriptor.acquisition(), Acquisition::FixedList { urls } if urls.len() == 1));
        assert!(descriptor.file_matcher().unwrap().is_none());
    }

    #[test]
    fn test_crawl_roots_are_listed_as_directories() {
        let descriptor = SourceDescriptor::builder("crawl", InputFormat::Json)
            .crawl(["https://ftp.example.org/pubmed/baseline", "https://ftp.example.org/updates/"], "*.gz")
            .schema(schema())
            .build()
            .unwrap();

        let Acquisition::RecursiveCrawl { roots, .. } = descriptor.acquisition() else {
            panic!("expected a crawl");
        };
        assert_eq!(roots[0].as_str(), "https://ftp.example.org/pubmed/baseline/");
        assert_eq!(roots[1].as_str(), "https://ftp.example.org/updates/");
    }

    #[test]
    fn test_configuration_errors() {
        let empty_roots = SourceDescriptor::builder("crawl", InputFormat::Json)
            .crawl(Vec::<String>::new(), "*.json")
            .schema(schema())
            .build();
        assert!(matches!(empty_roots, Err(IngestError::Configuration(_))));

        let both = SourceDescriptor::builder("both", InputFormat::Json)
            .urls(["http://example/a.json"])
            .crawl(["http://example/"], "*.json")
            .schema(schema())
            .build();
        assert!(both.is_err());

        let bad_url = SourceDescriptor::builder("bad", InputFormat::Json)
            .urls(["not a url"])
            .schema(schema())
            .build();
        assert!(bad_url.is_err());

        let xml_without_row_tag = SourceDescriptor::builder("xml", InputFormat::Xml)
            .urls(["http://example/a.xml"])
            .schema(schema())
            .build();
        assert!(xml_without_row_tag.is_err());

        let no_schema = SourceDescriptor::builder("empty", InputFormat::Json)
            .urls(["http://example/a.json"])
            .build();
        assert!(no_schema.is_err());
    }

    #[test]
    fn test_mini_pipeline_substitutes_fixed_subset() {
        let descriptor = SourceDescriptor::builder("medline", InputFormat::Xml)
            .crawl(["https://example.org/baseline/"], "*.xml.gz")
            .mini_urls(["https://example.org/updatefiles/one.xml.gz"])
            .input_option("rowTag", "PubmedArticle")
            .schema(schema())
            .build()
            .unwrap();

        assert!(matches!(
            descriptor.effective_acquisition(false),
            Acquisition::RecursiveCrawl { .. }
        ));
        match descriptor.effective_acquisition(true) {
            Acquisition::FixedList { urls } => assert_eq!(urls.len(), 1),
            other => panic!("unexpected acquisition {:?}", other),
        }
        assert!(descriptor.file_matcher().unwrap().unwrap().is_match("pubmed25n0001.xml.gz"));
    }

    #[test]
    fn test_descriptor_from_toml() {
        let file = DescriptorFile::from_toml_str(
            r#"
            name = "abstracts"
            urls = ["http://example/a.zip"]
            filename = "a.zip"
            extract_command = "unzip"
            input_format = "jsonl"
            flattern = false

            [[schema]]
            name = "id"
            type = "string"

            [[schema]]
            name = "abstract"
            type = "string"

            [normalizer]
            text = "abstract"
            identifier = "id"
            "#,
        )
        .unwrap();

        let (descriptor, mapping) = file.into_descriptor().unwrap();
        assert_eq!(descriptor.name(), "abstracts");
        assert_eq!(descriptor.archive(), ArchiveMethod::Zip);
        assert_eq!(descriptor.filename(), Some("a.zip"));
        assert_eq!(mapping.unwrap().identifier, "id");
    }

    #[test]
    fn test_descriptor_file_rejects_unknown_keys() {
        let result = DescriptorFile::from_toml_str(
            r#"
            name = "x"
            input_format = "json"
            schema = []
            colour = "blue"
            "#,
        );
        assert!(result.is_err());
    }
}
