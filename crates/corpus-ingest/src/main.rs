//! corpus-ingest - acquire and normalize text corpora

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use corpus_common::logging::{init_logging, LogConfig, LogLevel};
use corpus_ingest::config::PipelineConfigBuilder;
use corpus_ingest::descriptor::Acquisition;
use corpus_ingest::pipeline::{PipelineOrchestrator, RunOutcome};
use corpus_ingest::record::CanonicalRecord;
use corpus_ingest::sink::{JsonLinesSink, RecordSink};
use corpus_ingest::sources::{self, Source};
use corpus_ingest::PipelineConfig;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "corpus-ingest")]
#[command(author, version, about = "Corpus acquisition and normalization pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one source and write its canonical records as JSON lines
    Run(RunArgs),

    /// List the built-in sources
    ListSources,

    /// Print a built-in source descriptor as JSON
    ShowDescriptor {
        /// Source name
        name: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Built-in source name
    #[arg(long, conflicts_with = "descriptor", required_unless_present = "descriptor")]
    source: Option<String>,

    /// TOML source descriptor with a [normalizer] section
    #[arg(long)]
    descriptor: Option<PathBuf>,

    /// Output file (JSON lines)
    #[arg(short, long)]
    output: PathBuf,

    /// Write the run report here as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Local artifact directory [env: CORPUS_DATA_DIR]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// [env: CORPUS_DOWNLOAD_CONCURRENCY]
    #[arg(long)]
    download_concurrency: Option<usize>,

    /// [env: CORPUS_LISTING_CONCURRENCY]
    #[arg(long)]
    listing_concurrency: Option<usize>,

    /// [env: CORPUS_CPU_WORKERS]
    #[arg(long)]
    cpu_workers: Option<usize>,

    /// [env: CORPUS_MAX_ATTEMPTS]
    #[arg(long)]
    max_attempts: Option<u32>,

    /// [env: CORPUS_MAX_CRAWL_DEPTH]
    #[arg(long)]
    max_crawl_depth: Option<u32>,

    /// [env: CORPUS_BATCH_SIZE]
    #[arg(long)]
    batch_size: Option<usize>,

    /// Re-hash existing downloads before reusing them
    #[arg(long)]
    verify_checksums: bool,

    /// Keep records whose identifier was already emitted
    #[arg(long)]
    no_dedupe: bool,

    /// Only fetch each source's small fixed subset [env: TESTING_MINI_PIPELINE]
    #[arg(long)]
    mini: bool,
}

impl RunArgs {
    /// Environment first, then flags on top
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut builder = PipelineConfigBuilder::from_config(PipelineConfig::from_env()?);

        if let Some(dir) = &self.data_dir {
            builder = builder.data_dir(dir);
        }
        if let Some(value) = self.download_concurrency {
            builder = builder.download_concurrency(value);
        }
        if let Some(value) = self.listing_concurrency {
            builder = builder.listing_concurrency(value);
        }
        if let Some(value) = self.cpu_workers {
            builder = builder.cpu_workers(value);
        }
        if let Some(value) = self.max_attempts {
            builder = builder.max_attempts(value);
        }
        if let Some(value) = self.max_crawl_depth {
            builder = builder.max_crawl_depth(value);
        }
        if let Some(value) = self.batch_size {
            builder = builder.batch_size(value);
        }
        if self.verify_checksums {
            builder = builder.verify_checksums(true);
        }
        if self.no_dedupe {
            builder = builder.dedupe_identifiers(false);
        }
        if self.mini {
            builder = builder.mini_pipeline(true);
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }

    async fn source(&self) -> Result<Source> {
        match (&self.source, &self.descriptor) {
            (Some(name), _) => Ok(sources::find(name)?),
            (None, Some(path)) => Ok(Source::from_descriptor_file(path).await?),
            (None, None) => anyhow::bail!("either --source or --descriptor is required"),
        }
    }
}

/// Counts records on a spinner as they pass into the file
struct ProgressSink {
    inner: JsonLinesSink,
    progress: ProgressBar,
}

#[async_trait]
impl RecordSink for ProgressSink {
    async fn write(&mut self, record: CanonicalRecord) -> corpus_ingest::Result<()> {
        self.inner.write(record).await?;
        self.progress.inc(1);
        Ok(())
    }

    async fn finish(&mut self) -> corpus_ingest::Result<()> {
        self.inner.finish().await?;
        self.progress.finish_with_message(format!("{} records written", self.inner.written()));
        Ok(())
    }
}

fn record_spinner(source: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg} {pos} records") {
        pb.set_style(style);
    }
    pb.set_message(source.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Cancel the run on Ctrl+C; a second Ctrl+C is left to the default handler
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, cancelling run (partial downloads are kept for resume)");
                cancel.cancel();
            },
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    });
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = args.pipeline_config()?;
    let source = args.source().await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let progress = record_spinner(source.name());
    let mut sink = ProgressSink {
        inner: JsonLinesSink::create(&args.output)
            .await
            .with_context(|| format!("Failed to create {}", args.output.display()))?,
        progress,
    };

    let orchestrator = PipelineOrchestrator::new(config);
    let report = orchestrator
        .run_to_sink(&source, &mut sink, cancel)
        .await
        .with_context(|| format!("Run of source '{}' failed", source.name()))?;

    if let Some(path) = &args.report {
        let raw = serde_json::to_vec_pretty(&report)?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    info!(
        source = %report.source,
        outcome = %report.outcome(),
        records = report.records_emitted,
        output = %args.output.display(),
        "Ingestion finished"
    );
    Ok(match report.outcome() {
        RunOutcome::Failed => ExitCode::FAILURE,
        RunOutcome::Success | RunOutcome::PartialSuccess => ExitCode::SUCCESS,
    })
}

fn list_sources() -> Result<()> {
    for source in sources::builtin()? {
        let descriptor = &source.descriptor;
        let acquisition = match descriptor.acquisition() {
            Acquisition::FixedList { urls } => format!("{} url(s)", urls.len()),
            Acquisition::RecursiveCrawl { roots, .. } => format!("crawl of {} root(s)", roots.len()),
        };
        println!(
            "{:<10} {:<6} {:<12} {}",
            descriptor.name(),
            descriptor.input_format().to_string(),
            format!("{:?}", descriptor.archive()).to_lowercase(),
            acquisition
        );
    }
    Ok(())
}

fn show_descriptor(name: &str) -> Result<()> {
    let source = sources::find(name)?;
    println!("{}", serde_json::to_string_pretty(&source.descriptor)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(level)
        .log_file_prefix("corpus-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::ListSources => list_sources().map(|()| ExitCode::SUCCESS),
        Command::ShowDescriptor { name } => show_descriptor(&name).map(|()| ExitCode::SUCCESS),
    }
}
