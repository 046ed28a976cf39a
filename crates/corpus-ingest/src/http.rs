//! Shared HTTP client for index listings and artifact downloads

use crate::config::PipelineConfig;
use crate::error::{FetchError, IngestError, Result};
use crate::retry::{classify_reqwest, classify_status, RetryPolicy};
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloads are bounded by an idle read timeout, so a slow but live transfer
/// of a large archive is never cut off; listings also get a total timeout.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
    listing_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let client = Client::builder()
            .connect_timeout(timeout.min(CONNECT_TIMEOUT))
            .read_timeout(timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| IngestError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            retry: config.retry_policy(),
            listing_timeout: timeout,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GET a text body with retries. Returns the result and attempts made.
    pub async fn get_text(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> (std::result::Result<String, FetchError>, u32) {
        if let Err(e) = ensure_fetchable(url) {
            return (Err(e), 0);
        }

        self.retry
            .run(url.as_str(), cancel, move |_| async move {
                let response = tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    response = self.client.get(url.clone()).timeout(self.listing_timeout).send() => response,
                }
                .map_err(|e| classify_reqwest(&e))?;

                if let Some(error) = classify_status(response.status()) {
                    return Err(error);
                }

                tokio::select! {
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                    body = response.text() => body.map_err(|e| classify_reqwest(&e)),
                }
            })
            .await
    }
}

/// Only http(s) URLs can be fetched
pub fn ensure_fetchable(url: &Url) -> std::result::Result<(), FetchError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FetchError::Permanent(format!("unsupported scheme '{}'", other))),
    }
}
