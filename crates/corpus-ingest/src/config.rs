//! Pipeline configuration
//!
//! Values come from [`Default`], then environment variables ([`PipelineConfig::from_env`]),
//! then explicit overrides through the builder or CLI flags.

use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment toggle restricting sources to their small fixed URL subset
pub const MINI_PIPELINE_ENV: &str = "TESTING_MINI_PIPELINE";

/// Configuration shared by every stage of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the local artifact namespace
    pub data_dir: PathBuf,

    /// Concurrent artifact downloads
    pub download_concurrency: usize,

    /// Concurrent index page fetches (kept smaller than downloads)
    pub listing_concurrency: usize,

    /// Blocking workers for extraction and loading
    pub cpu_workers: usize,

    /// Attempts per network operation, first try included
    pub max_attempts: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Idle read timeout in seconds for transfers; total timeout for listings
    pub request_timeout_secs: u64,

    /// Recursion bound for crawled sources without their own `max_depth`
    pub max_crawl_depth: u32,

    /// Structured records handed to the normalizer at once
    pub batch_size: usize,

    /// Re-hash existing downloads before trusting them
    pub verify_checksums: bool,

    /// Drop records whose identifier was already emitted for the same artifact
    pub dedupe_identifiers: bool,

    /// Resolve sources to their `mini_urls` subset
    pub mini_pipeline: bool,

    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            download_concurrency: 8,
            listing_concurrency: 2,
            cpu_workers: 4,
            max_attempts: 4,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            request_timeout_secs: 600,
            max_crawl_depth: 8,
            batch_size: 1024,
            verify_checksums: false,
            dedupe_identifiers: true,
            mini_pipeline: false,
            user_agent: format!("corpus-ingest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Defaults overridden by `CORPUS_*` environment variables
    ///
    /// `TESTING_MINI_PIPELINE` switches on mini mode when set to anything but
    /// `0`/`false`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CORPUS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = env_parse("CORPUS_DOWNLOAD_CONCURRENCY")? {
            config.download_concurrency = value;
        }
        if let Some(value) = env_parse("CORPUS_LISTING_CONCURRENCY")? {
            config.listing_concurrency = value;
        }
        if let Some(value) = env_parse("CORPUS_CPU_WORKERS")? {
            config.cpu_workers = value;
        }
        if let Some(value) = env_parse("CORPUS_MAX_ATTEMPTS")? {
            config.max_attempts = value;
        }
        if let Some(value) = env_parse("CORPUS_BACKOFF_BASE_MS")? {
            config.backoff_base_ms = value;
        }
        if let Some(value) = env_parse("CORPUS_BACKOFF_MAX_MS")? {
            config.backoff_max_ms = value;
        }
        if let Some(value) = env_parse("CORPUS_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout_secs = value;
        }
        if let Some(value) = env_parse("CORPUS_MAX_CRAWL_DEPTH")? {
            config.max_crawl_depth = value;
        }
        if let Some(value) = env_parse("CORPUS_BATCH_SIZE")? {
            config.batch_size = value;
        }
        if let Some(value) = env_parse("CORPUS_VERIFY_CHECKSUMS")? {
            config.verify_checksums = value;
        }
        if let Some(value) = env_parse("CORPUS_DEDUPE_IDENTIFIERS")? {
            config.dedupe_identifiers = value;
        }
        if let Ok(agent) = std::env::var("CORPUS_USER_AGENT") {
            config.user_agent = agent;
        }
        if let Ok(value) = std::env::var(MINI_PIPELINE_ENV) {
            config.mini_pipeline = !matches!(value.trim(), "" | "0" | "false");
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.download_concurrency == 0 {
            return Err(IngestError::config("download_concurrency must be greater than 0"));
        }
        if self.listing_concurrency == 0 {
            return Err(IngestError::config("listing_concurrency must be greater than 0"));
        }
        if self.cpu_workers == 0 {
            return Err(IngestError::config("cpu_workers must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(IngestError::config("max_attempts must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(IngestError::config("request_timeout_secs must be greater than 0"));
        }
        if self.max_crawl_depth == 0 {
            return Err(IngestError::config("max_crawl_depth must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("batch_size must be greater than 0"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(IngestError::config("backoff_max_ms must not be below backoff_base_ms"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| IngestError::config(format!("{}='{}': {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for PipelineConfig
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Start from an existing configuration, e.g. one read from the environment
    pub fn from_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn download_concurrency(mut self, value: usize) -> Self {
        self.config.download_concurrency = value;
        self
    }

    pub fn listing_concurrency(mut self, value: usize) -> Self {
        self.config.listing_concurrency = value;
        self
    }

    pub fn cpu_workers(mut self, value: usize) -> Self {
        self.config.cpu_workers = value;
        self
    }

    pub fn max_attempts(mut self, value: u32) -> Self {
        self.config.max_attempts = value;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_base_ms = base.as_millis() as u64;
        self.config.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn request_timeout_secs(mut self, value: u64) -> Self {
        self.config.request_timeout_secs = value;
        self
    }

    pub fn max_crawl_depth(mut self, value: u32) -> Self {
        self.config.max_crawl_depth = value;
        self
    }

    pub fn batch_size(mut self, value: usize) -> Self {
        self.config.batch_size = value;
        self
    }

    pub fn verify_checksums(mut self, value: bool) -> Self {
        self.config.verify_checksums = value;
        self
    }

    pub fn dedupe_identifiers(mut self, value: bool) -> Self {
        self.config.dedupe_identifiers = value;
        self
    }

    pub fn mini_pipeline(mut self, value: bool) -> Self {
        self.config.mini_pipeline = value;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.listing_concurrency < config.download_concurrency);
    }

    #[test]
    fn test_invalid_config() {
        let config = PipelineConfig::builder().download_concurrency(0).build();
        assert!(matches!(config.validate(), Err(IngestError::Configuration(_))));

        let config = PipelineConfig::builder().max_attempts(0).build();
        assert!(config.validate().is_err());

        let config = PipelineConfig::builder()
            .backoff(Duration::from_secs(10), Duration::from_secs(1))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = PipelineConfig::builder()
            .data_dir("/tmp/corpus")
            .max_attempts(3)
            .backoff(Duration::from_millis(5), Duration::from_millis(20))
            .mini_pipeline(true)
            .build();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/corpus"));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 5);
        assert!(config.mini_pipeline);
        assert_eq!(config.retry_policy().max_attempts(), 3);
    }
}
