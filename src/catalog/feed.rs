use serde::Deserialize;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

use crate::catalog::ModelFeedRecord;
use crate::error::Result;

/// Snapshot payload from the provider listing: `{"data": [...]}`.
#[derive(Debug, Deserialize)]
struct FeedResponse {
    data: Vec<ModelFeedRecord>,
}

/// HTTP client for the external model catalog feed. The feed delivers full
/// snapshots, not deltas; one fetch feeds one reconciliation pass.
pub struct CatalogFeedClient {
    http: reqwest::Client,
    feed_url: String,
    max_retries: usize,
}

impl CatalogFeedClient {
    pub fn new(feed_url: impl Into<String>, timeout_seconds: u64, max_retries: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            feed_url: feed_url.into(),
            max_retries,
        })
    }

    /// Fetch the current full snapshot, retrying transient failures with
    /// exponential backoff.
    pub async fn fetch_snapshot(&self) -> Result<Vec<ModelFeedRecord>> {
        let strategy = ExponentialBackoff::from_millis(250)
            .map(jitter)
            .take(self.max_retries);

        let snapshot = Retry::spawn(strategy, || async {
            debug!("Fetching catalog feed from {}", self.feed_url);
            let response = self
                .http
                .get(&self.feed_url)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match response {
                Ok(response) => response.json::<FeedResponse>().await.map_err(|e| {
                    warn!("Catalog feed returned malformed payload: {}", e);
                    e
                }),
                Err(e) => {
                    warn!("Catalog feed fetch failed: {}", e);
                    Err(e)
                }
            }
        })
        .await?;

        debug!("Catalog feed returned {} models", snapshot.data.len());
        Ok(snapshot.data)
    }
}
