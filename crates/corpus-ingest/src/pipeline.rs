//! One ingestion run per source
//!
//! The orchestrator resolves artifacts and pushes each one independently
//! through download, extraction, loading and normalization:
//!
//! ```text
//! resolver ──► fetch ──► extract ──► load + select ──► gate ──► record stream
//!  (stream)   (I/O pool)   (cpu_workers, blocking pool)  (single task)
//! ```
//!
//! Downloads are bounded by `download_concurrency`, extraction and loading by
//! `cpu_workers`. Canonical records are streamed to the caller as they are
//! produced; nothing is materialized per source. The final [`RunReport`]
//! arrives through the run's join handle once every artifact has settled.

use crate::artifact::{Artifact, ArtifactFailure, ArtifactState, DataLayout, ExtractedFile, PathLocks, Stage};
use crate::config::PipelineConfig;
use crate::downloader::{Downloader, Transfer};
use crate::error::{IngestError, Result};
use crate::extractor::Extractor;
use crate::http::HttpClient;
use crate::loader::{LoadSpec, NativeLoader, StructuredLoader};
use crate::normalizer::{Normalizer, RecordGate};
use crate::record::{CandidateRecord, CanonicalRecord, DropReason};
use crate::resolver::{ArtifactResolver, ArtifactStream, CrawlStats};
use crate::sink::RecordSink;
use crate::sources::Source;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// How a run ended, as reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Some artifacts, files or listings failed; the rest were normalized
    PartialSuccess,
    /// Not a single artifact was normalized, or not a single record emitted
    Failed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialSuccess => "partial success",
            RunOutcome::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of one source run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resolved: u64,
    /// Transferred over the network during this run
    pub downloaded: u64,
    /// Found complete on disk; no request made
    pub reused: u64,
    pub bytes_downloaded: u64,
    pub failed: u64,
    pub extracted: u64,
    pub files_loaded: u64,
    pub files_skipped: u64,
    pub normalized: u64,
    pub records_emitted: u64,
    /// Records violating the canonical invariants
    pub records_dropped: u64,
    pub duplicates_dropped: u64,
    pub listing_failures: u64,
    pub depth_limited: u64,
    pub cancelled: bool,
    pub failures: Vec<ArtifactFailure>,
    /// Every resolved artifact in its final state
    pub artifacts: Vec<Artifact>,
}

impl RunReport {
    fn new(run_id: Uuid, source: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            source: source.to_string(),
            started_at: now,
            finished_at: now,
            resolved: 0,
            downloaded: 0,
            reused: 0,
            bytes_downloaded: 0,
            failed: 0,
            extracted: 0,
            files_loaded: 0,
            files_skipped: 0,
            normalized: 0,
            records_emitted: 0,
            records_dropped: 0,
            duplicates_dropped: 0,
            listing_failures: 0,
            depth_limited: 0,
            cancelled: false,
            failures: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.normalized == 0 || self.records_emitted == 0 {
            RunOutcome::Failed
        } else if self.failed > 0
            || self.files_skipped > 0
            || self.listing_failures > 0
            || self.cancelled
        {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        }
    }

    /// Artifacts eligible for [`PipelineOrchestrator::retry_failed`]
    pub fn failed_artifacts(&self) -> Vec<Artifact> {
        self.artifacts
            .iter()
            .filter(|a| a.state() == ArtifactState::Failed)
            .cloned()
            .collect()
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    fn record(&mut self, processed: Processed) {
        self.resolved += 1;
        match processed.transfer {
            Transfer::Fetched { bytes } => {
                self.downloaded += 1;
                self.bytes_downloaded += bytes;
            },
            Transfer::Reused => self.reused += 1,
            Transfer::Failed | Transfer::Cancelled => {},
        }
        if processed.extracted {
            self.extracted += 1;
        }
        self.files_loaded += processed.files_loaded;
        self.files_skipped += processed.files_skipped;

        match processed.artifact.state() {
            ArtifactState::Normalized => self.normalized += 1,
            ArtifactState::Failed => {
                self.failed += 1;
                if let Some(failure) = processed.artifact.failure() {
                    self.failures.push(failure.clone());
                }
            },
            _ => {},
        }
        self.artifacts.push(processed.artifact);
    }
}

/// A run in progress: the canonical record stream plus the eventual report.
///
/// The stream must be drained (or dropped) for the run to make progress.
pub struct RunHandle {
    pub run_id: Uuid,
    records: ReceiverStream<CanonicalRecord>,
    report: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn records(&mut self) -> &mut ReceiverStream<CanonicalRecord> {
        &mut self.records
    }

    pub fn into_parts(self) -> (ReceiverStream<CanonicalRecord>, JoinHandle<RunReport>) {
        (self.records, self.report)
    }

    /// Discard any records not yet consumed and wait for the report
    pub async fn finish(self) -> Result<RunReport> {
        let (mut records, report) = self.into_parts();
        while records.next().await.is_some() {}
        join_report(report).await
    }
}

async fn join_report(report: JoinHandle<RunReport>) -> Result<RunReport> {
    report
        .await
        .map_err(|e| IngestError::Task(format!("run driver: {}", e)))
}

/// What happened to one artifact
struct Processed {
    artifact: Artifact,
    transfer: Transfer,
    extracted: bool,
    files_loaded: u64,
    files_skipped: u64,
}

impl Processed {
    fn new(artifact: Artifact, transfer: Transfer) -> Self {
        Self {
            artifact,
            transfer,
            extracted: false,
            files_loaded: 0,
            files_skipped: 0,
        }
    }
}

/// Everything a per-artifact task needs, shared across tasks
struct Stages {
    downloader: Downloader,
    extractor: Extractor,
    loader: Arc<dyn StructuredLoader>,
    spec: Arc<LoadSpec>,
    normalizer: Arc<dyn Normalizer>,
    cpu: Arc<Semaphore>,
    batch_size: usize,
    candidates: mpsc::Sender<GateInput>,
}

/// Normalizer output on its way to the gate, tagged with its artifact
enum GateInput {
    Batch {
        artifact: String,
        candidates: Vec<CandidateRecord>,
    },
    /// No more batches will arrive for this artifact
    Settled { artifact: String },
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    loader: Arc<dyn StructuredLoader>,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            loader: Arc::new(NativeLoader),
        }
    }

    /// Swap in a different record-parsing engine
    pub fn with_loader(mut self, loader: impl StructuredLoader + 'static) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start a run. Configuration problems and crawl-root failures are
    /// returned here, before any artifact is downloaded.
    pub async fn run(&self, source: &Source, cancel: CancellationToken) -> Result<RunHandle> {
        let http = self.prepare(source)?;
        let resolver = ArtifactResolver::new(http.clone(), &self.config);

        info!(
            source = source.name(),
            data_dir = %self.config.data_dir.display(),
            mini = self.config.mini_pipeline,
            "Starting ingestion run"
        );
        let artifacts = resolver.resolve(&source.descriptor, &cancel).await?;
        Ok(self.launch(source, http, artifacts, Some(resolver.stats()), cancel))
    }

    /// Operator retry: failed artifacts go back to Pending and run again
    pub async fn retry_failed(
        &self,
        source: &Source,
        artifacts: Vec<Artifact>,
        cancel: CancellationToken,
    ) -> Result<RunHandle> {
        let http = self.prepare(source)?;

        let mut retried = Vec::with_capacity(artifacts.len());
        for mut artifact in artifacts {
            if artifact.state() != ArtifactState::Failed {
                debug!(url = %artifact.url, state = %artifact.state(), "Not failed, skipping retry");
                continue;
            }
            artifact.reset_for_retry()?;
            retried.push(artifact);
        }
        info!(source = source.name(), count = retried.len(), "Retrying failed artifacts");

        Ok(self.launch(source, http, stream::iter(retried).boxed(), None, cancel))
    }

    /// Run and write every canonical record into `sink`
    pub async fn run_to_sink(
        &self,
        source: &Source,
        sink: &mut dyn RecordSink,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let handle = self.run(source, cancel.clone()).await?;
        drain_into(handle, sink, &cancel).await
    }

    fn prepare(&self, source: &Source) -> Result<HttpClient> {
        self.config.validate()?;
        source.descriptor.validate()?;
        HttpClient::new(&self.config)
    }

    fn launch(
        &self,
        source: &Source,
        http: HttpClient,
        artifacts: ArtifactStream,
        crawl: Option<Arc<CrawlStats>>,
        cancel: CancellationToken,
    ) -> RunHandle {
        let config = &self.config;
        let descriptor = &source.descriptor;
        let run_id = Uuid::new_v4();
        let locks = Arc::new(PathLocks::default());
        let layout = DataLayout::new(&config.data_dir, descriptor.name());

        let (candidate_tx, candidate_rx) = mpsc::channel(config.cpu_workers * 2);
        let (record_tx, record_rx) = mpsc::channel(config.batch_size);

        let stages = Arc::new(Stages {
            downloader: Downloader::new(
                http,
                layout.clone(),
                descriptor.filename().map(str::to_string),
                config,
                Arc::clone(&locks),
            ),
            extractor: Extractor::new(
                layout,
                descriptor.archive(),
                descriptor.input_format(),
                descriptor.extracted_filename().map(str::to_string),
                locks,
            ),
            loader: Arc::clone(&self.loader),
            spec: Arc::new(LoadSpec::from_descriptor(descriptor)),
            normalizer: Arc::clone(&source.normalizer),
            cpu: Arc::new(Semaphore::new(config.cpu_workers)),
            batch_size: config.batch_size,
            candidates: candidate_tx,
        });

        let gate = RecordGate::new(descriptor.name(), config.dedupe_identifiers);
        let emitter = tokio::spawn(emit(gate, candidate_rx, record_tx));

        let mut report = RunReport::new(run_id, descriptor.name());
        let in_flight = config.download_concurrency + config.cpu_workers;
        let span = info_span!("run", source = descriptor.name(), run_id = %run_id);

        let driver = tokio::spawn(
            async move {
                let mut settled = artifacts
                    .take_until(cancel.clone().cancelled_owned())
                    .map(|artifact| process(Arc::clone(&stages), artifact, cancel.clone()))
                    .buffer_unordered(in_flight)
                    .boxed();

                while let Some(processed) = settled.next().await {
                    report.record(processed);
                }
                drop(settled);
                drop(stages);

                match emitter.await {
                    Ok(gate) => {
                        report.records_emitted = gate.emitted();
                        report.records_dropped = gate.dropped_invalid();
                        report.duplicates_dropped = gate.dropped_for(DropReason::DuplicateIdentifier);
                    },
                    Err(e) => warn!(error = %e, "Record emitter task failed"),
                }
                if let Some(crawl) = crawl {
                    let summary = crawl.summary();
                    report.listing_failures = summary.listing_failures;
                    report.depth_limited = summary.depth_limited;
                }
                report.cancelled = cancel.is_cancelled();
                report.finished_at = Utc::now();
                log_report(&report);
                report
            }
            .instrument(span),
        );

        RunHandle {
            run_id,
            records: ReceiverStream::new(record_rx),
            report: driver,
        }
    }
}

/// Write a run's records into a sink, then wait for its report
pub async fn drain_into(
    handle: RunHandle,
    sink: &mut dyn RecordSink,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let (mut records, report) = handle.into_parts();
    while let Some(record) = records.next().await {
        if let Err(e) = sink.write(record).await {
            warn!(error = %e, "Sink rejected record, cancelling run");
            cancel.cancel();
            drop(records);
            join_report(report).await?;
            return Err(e);
        }
    }
    sink.finish().await?;
    join_report(report).await
}

/// Single consumer applying the canonical invariants, so drop and duplicate
/// accounting needs no locking
async fn emit(
    mut gate: RecordGate,
    mut inputs: mpsc::Receiver<GateInput>,
    records: mpsc::Sender<CanonicalRecord>,
) -> RecordGate {
    let mut open = true;
    while let Some(input) = inputs.recv().await {
        let (artifact, candidates) = match input {
            GateInput::Batch { artifact, candidates } => (artifact, candidates),
            GateInput::Settled { artifact } => {
                gate.close_scope(&artifact);
                continue;
            },
        };
        for candidate in candidates {
            if let Some(record) = gate.admit(&artifact, candidate) {
                if open && records.send(record).await.is_err() {
                    debug!("Record stream closed by consumer");
                    open = false;
                }
            }
        }
    }
    gate
}

/// Drive one artifact as far as it will go
#[instrument(level = "debug", skip_all, fields(url = %artifact.url))]
async fn process(stages: Arc<Stages>, artifact: Artifact, cancel: CancellationToken) -> Processed {
    if cancel.is_cancelled() {
        return Processed::new(artifact, Transfer::Cancelled);
    }

    let (mut artifact, transfer) = stages.downloader.fetch(artifact, &cancel).await;
    let mut processed = match transfer {
        Transfer::Failed | Transfer::Cancelled => return Processed::new(artifact, transfer),
        Transfer::Reused | Transfer::Fetched { .. } => Processed::new(artifact.clone(), transfer),
    };

    let _permit = tokio::select! {
        _ = cancel.cancelled() => return processed,
        permit = Arc::clone(&stages.cpu).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return processed,
        },
    };

    let Some(extraction) = stages.extractor.extract(&mut artifact).await else {
        processed.artifact = artifact;
        return processed;
    };
    processed.extracted = true;

    if extraction.files.is_empty() {
        fail(&mut artifact, Stage::Extract, "archive produced no parseable files");
        processed.artifact = artifact;
        return processed;
    }

    for file in extraction.files {
        if cancel.is_cancelled() {
            break;
        }
        match load_file(&stages, file.clone(), &cancel).await {
            Ok(records) => {
                debug!(path = %file.path.display(), records, "Loaded file");
                processed.files_loaded += 1;
            },
            Err(IngestError::Cancelled) => break,
            Err(e) => {
                warn!(url = %artifact.url, path = %file.path.display(), error = %e, "Skipping file");
                processed.files_skipped += 1;
            },
        }
    }

    let settled = GateInput::Settled {
        artifact: artifact.url.to_string(),
    };
    if stages.candidates.send(settled).await.is_err() {
        debug!(url = %artifact.url, "Record gate already closed");
    }

    if cancel.is_cancelled() {
        info!(url = %artifact.url, state = %artifact.state(), "Artifact interrupted by cancellation");
    } else if processed.files_loaded == 0 {
        fail(&mut artifact, Stage::Load, "no file could be loaded");
    } else {
        let advanced = artifact
            .advance(ArtifactState::Loaded)
            .and_then(|()| artifact.advance(ArtifactState::Normalized));
        if let Err(e) = advanced {
            fail(&mut artifact, Stage::Normalize, e.to_string());
        }
    }

    processed.artifact = artifact;
    processed
}

fn fail(artifact: &mut Artifact, stage: Stage, cause: impl Into<String>) {
    if let Err(e) = artifact.fail(stage, cause) {
        debug!(url = %artifact.url, error = %e, "Artifact already terminal");
    }
}

/// Load one file on the blocking pool, normalizing it batch by batch.
/// Records before a mid-file failure have already been handed on.
async fn load_file(stages: &Arc<Stages>, file: ExtractedFile, cancel: &CancellationToken) -> Result<u64> {
    let stages = Arc::clone(stages);
    let cancel = cancel.clone();
    let path = file.path.clone();

    tokio::task::spawn_blocking(move || {
        let records = stages.loader.load(&file, &stages.spec)?;
        let mut batch = Vec::with_capacity(stages.batch_size);
        let mut count = 0u64;

        let flush = |batch: &mut Vec<_>| -> Result<()> {
            let candidates = stages.normalizer.select(std::mem::take(batch));
            let input = GateInput::Batch {
                artifact: file.artifact_url.clone(),
                candidates,
            };
            stages
                .candidates
                .blocking_send(input)
                .map_err(|_| IngestError::Cancelled)
        };

        for record in records {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            match record {
                Ok(record) => batch.push(record),
                Err(e) => {
                    flush(&mut batch)?;
                    return Err(e);
                },
            }
            count += 1;
            if batch.len() >= stages.batch_size {
                flush(&mut batch)?;
            }
        }
        if !batch.is_empty() {
            flush(&mut batch)?;
        }
        Ok(count)
    })
    .await
    .map_err(|e| IngestError::Load {
        path,
        reason: format!("loader task failed: {}", e),
    })?
}

fn log_report(report: &RunReport) {
    let outcome = report.outcome();
    let summary = format!(
        "{} resolved, {} downloaded, {} reused, {} failed, {} extracted, {} normalized; {} records emitted, {} dropped, {} duplicates",
        report.resolved,
        report.downloaded,
        report.reused,
        report.failed,
        report.extracted,
        report.normalized,
        report.records_emitted,
        report.records_dropped,
        report.duplicates_dropped,
    );

    match outcome {
        RunOutcome::Success => info!(
            source = %report.source,
            run_id = %report.run_id,
            duration_s = report.duration_seconds(),
            "Run succeeded: {}",
            summary
        ),
        RunOutcome::PartialSuccess => warn!(
            source = %report.source,
            run_id = %report.run_id,
            files_skipped = report.files_skipped,
            listing_failures = report.listing_failures,
            cancelled = report.cancelled,
            "Run partially succeeded: {}",
            summary
        ),
        RunOutcome::Failed => warn!(
            source = %report.source,
            run_id = %report.run_id,
            cancelled = report.cancelled,
            "Run failed, no artifact was normalized: {}",
            summary
        ),
    }
    for failure in &report.failures {
        warn!(url = %failure.url, stage = %failure.stage, cause = %failure.cause, "Failed artifact");
    }
    if report.depth_limited > 0 {
        warn!(branches = report.depth_limited, "Crawl branches cut by the depth bound");
    }
}
