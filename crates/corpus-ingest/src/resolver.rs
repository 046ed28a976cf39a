//! Artifact discovery: fixed URL lists and recursive index crawling
//!
//! Crawl roots are listed before anything is returned, so a source whose roots
//! are unreachable fails before a single download starts. Deeper listings are
//! fetched lazily by a background task and artifacts are streamed out as soon
//! as they are seen.

use crate::artifact::Artifact;
use crate::config::PipelineConfig;
use crate::descriptor::{Acquisition, SourceDescriptor};
use crate::error::{FetchError, IngestError, Result};
use crate::http::HttpClient;
use futures::stream::{self, BoxStream, StreamExt};
use globset::GlobMatcher;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const ARTIFACT_CHANNEL_CAPACITY: usize = 256;

/// Lazily produced artifacts of one source
pub type ArtifactStream = BoxStream<'static, Artifact>;

/// Counters updated by the background crawl
#[derive(Debug, Default)]
pub struct CrawlStats {
    listings: AtomicU64,
    listing_failures: AtomicU64,
    depth_limited: AtomicU64,
}

/// Point-in-time copy of [`CrawlStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub listings: u64,
    pub listing_failures: u64,
    pub depth_limited: u64,
}

impl CrawlStats {
    pub fn summary(&self) -> CrawlSummary {
        CrawlSummary {
            listings: self.listings.load(Ordering::Relaxed),
            listing_failures: self.listing_failures.load(Ordering::Relaxed),
            depth_limited: self.depth_limited.load(Ordering::Relaxed),
        }
    }
}

/// One entry of an index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListingEntry {
    Directory(Url),
    File(Url),
}

/// A directory queued for listing
#[derive(Debug, Clone)]
struct Branch {
    url: Url,
    root: Url,
    depth: u32,
}

pub struct ArtifactResolver {
    http: HttpClient,
    listing_concurrency: usize,
    default_max_depth: u32,
    mini_pipeline: bool,
    stats: Arc<CrawlStats>,
}

impl ArtifactResolver {
    pub fn new(http: HttpClient, config: &PipelineConfig) -> Self {
        Self {
            http,
            listing_concurrency: config.listing_concurrency,
            default_max_depth: config.max_crawl_depth,
            mini_pipeline: config.mini_pipeline,
            stats: Arc::new(CrawlStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CrawlStats> {
        Arc::clone(&self.stats)
    }

    /// Turn a descriptor into a lazy artifact sequence
    pub async fn resolve(
        &self,
        descriptor: &SourceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ArtifactStream> {
        match descriptor.effective_acquisition(self.mini_pipeline) {
            Acquisition::FixedList { urls } => {
                let mut seen = HashSet::new();
                let artifacts: Vec<Artifact> = urls
                    .into_iter()
                    .filter(|url| seen.insert(url.clone()))
                    .map(Artifact::new)
                    .collect();
                info!(source = descriptor.name(), count = artifacts.len(), "Resolved fixed url list");
                Ok(stream::iter(artifacts).boxed())
            },
            Acquisition::RecursiveCrawl {
                roots, max_depth, ..
            } => {
                let matcher = descriptor.file_matcher()?.ok_or_else(|| {
                    IngestError::config("recursive source without match_condition")
                })?;
                let max_depth = max_depth.unwrap_or(self.default_max_depth);
                self.crawl(descriptor.name(), roots, matcher, max_depth, cancel).await
            },
        }
    }

    async fn crawl(
        &self,
        source: &str,
        roots: Vec<Url>,
        matcher: GlobMatcher,
        max_depth: u32,
        cancel: &CancellationToken,
    ) -> Result<ArtifactStream> {
        let mut crawler = Crawler {
            http: self.http.clone(),
            matcher,
            max_depth,
            concurrency: self.listing_concurrency,
            stats: Arc::clone(&self.stats),
            cancel: cancel.clone(),
            visited: HashSet::new(),
            yielded: HashSet::new(),
        };

        let branches: Vec<Branch> = roots
            .into_iter()
            .map(normalize_url)
            .filter(|root| crawler.visited.insert(root.clone()))
            .map(|root| Branch {
                url: root.clone(),
                root,
                depth: 0,
            })
            .collect();

        info!(source, roots = branches.len(), max_depth, "Listing crawl roots");

        let mut listings = crawler.list_all(branches);
        let mut frontier = Vec::new();
        let mut found = Vec::new();
        while let Some((branch, result)) = listings.next().await {
            let html = match result {
                Ok(html) => html,
                Err(FetchError::Cancelled) => return Err(IngestError::Cancelled),
                Err(e) => {
                    return Err(IngestError::CrawlRoot {
                        url: branch.url.to_string(),
                        reason: e.to_string(),
                    })
                },
            };
            crawler.stats.listings.fetch_add(1, Ordering::Relaxed);
            crawler.expand(&branch, &html, &mut frontier, &mut found);
        }
        drop(listings);

        let (tx, rx) = mpsc::channel(ARTIFACT_CHANNEL_CAPACITY);
        let source = source.to_string();
        tokio::spawn(async move {
            for artifact in found {
                if tx.send(artifact).await.is_err() {
                    return;
                }
            }
            crawler.run(frontier, &tx).await;
            let summary = crawler.stats.summary();
            info!(
                source = %source,
                artifacts = crawler.yielded.len(),
                listings = summary.listings,
                listing_failures = summary.listing_failures,
                depth_limited = summary.depth_limited,
                "Crawl finished"
            );
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

struct Crawler {
    http: HttpClient,
    matcher: GlobMatcher,
    max_depth: u32,
    concurrency: usize,
    stats: Arc<CrawlStats>,
    cancel: CancellationToken,
    visited: HashSet<Url>,
    yielded: HashSet<Url>,
}

impl Crawler {
    /// Fetch listings with at most `concurrency` requests in flight
    fn list_all(
        &self,
        branches: Vec<Branch>,
    ) -> BoxStream<'static, (Branch, std::result::Result<String, FetchError>)> {
        let http = self.http.clone();
        let cancel = self.cancel.clone();
        stream::iter(branches)
            .map(move |branch| {
                let http = http.clone();
                let cancel = cancel.clone();
                async move {
                    let (result, _attempts) = http.get_text(&branch.url, &cancel).await;
                    (branch, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .boxed()
    }

    /// Breadth-first over the remaining directories, one depth level at a time
    async fn run(&mut self, mut frontier: Vec<Branch>, tx: &mpsc::Sender<Artifact>) {
        while !frontier.is_empty() {
            if self.cancel.is_cancelled() {
                debug!("Crawl cancelled");
                return;
            }

            let mut listings = self.list_all(std::mem::take(&mut frontier));
            while let Some((branch, result)) = listings.next().await {
                match result {
                    Ok(html) => {
                        self.stats.listings.fetch_add(1, Ordering::Relaxed);
                        let mut found = Vec::new();
                        self.expand(&branch, &html, &mut frontier, &mut found);
                        for artifact in found {
                            if tx.send(artifact).await.is_err() {
                                return;
                            }
                        }
                    },
                    Err(FetchError::NotFound) => {
                        debug!(url = %branch.url, "Index page not found, no further entries");
                    },
                    Err(FetchError::Cancelled) => return,
                    Err(e) => {
                        self.stats.listing_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(url = %branch.url, error = %e, "Listing failed, skipping branch");
                    },
                }
            }
        }
    }

    /// Queue unseen subdirectories within the depth bound and collect new files
    fn expand(
        &mut self,
        branch: &Branch,
        html: &str,
        frontier: &mut Vec<Branch>,
        found: &mut Vec<Artifact>,
    ) {
        for entry in parse_listing(&branch.url, &branch.root, html, &self.matcher) {
            match entry {
                ListingEntry::Directory(url) => {
                    if !self.visited.insert(url.clone()) {
                        continue;
                    }
                    let depth = branch.depth + 1;
                    if depth > self.max_depth {
                        self.stats.depth_limited.fetch_add(1, Ordering::Relaxed);
                        warn!(url = %url, max_depth = self.max_depth, "Depth bound reached, not descending");
                        continue;
                    }
                    frontier.push(Branch {
                        url,
                        root: branch.root.clone(),
                        depth,
                    });
                },
                ListingEntry::File(url) => {
                    if self.yielded.insert(url.clone()) {
                        found.push(Artifact::new(url));
                    }
                },
            }
        }
    }
}

fn normalize_url(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// Classify the links of an index page.
///
/// Directories are links ending in `/` that stay under `root`. Files are links
/// whose last path segment matches the glob. Everything else (sort links,
/// parent directories, other hosts, non-matching files) is ignored.
pub(crate) fn parse_listing(
    page: &Url,
    root: &Url,
    html: &str,
    matcher: &GlobMatcher,
) -> Vec<ListingEntry> {
    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(e) => {
            warn!("Invalid link selector: {:?}", e);
            return Vec::new();
        },
    };

    let document = Html::parse_document(html);
    let mut entries = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('?') || href.starts_with('#') {
            continue;
        }
        let Ok(url) = page.join(href).map(normalize_url) else {
            debug!(href, "Ignoring unparseable link");
            continue;
        };
        if url.scheme() != page.scheme() || url.host_str() != page.host_str() || url.port() != page.port() {
            continue;
        }
        if url == *page || !url.path().starts_with(root.path()) {
            continue;
        }

        if url.path().ends_with('/') {
            if url.query().is_none() {
                entries.push(ListingEntry::Directory(url));
            }
            continue;
        }

        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        if matcher.is_match(&name) {
            entries.push(ListingEntry::File(url));
        } else {
            debug!(url = %url, "Ignoring listing entry that matches neither glob nor directory");
        }
    }

    entries
}
