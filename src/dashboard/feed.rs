use crate::client::{endpoint, ApiRequest};
use crate::config::{FeedConfig, MergeMode};
use crate::resilience::{RequestExecutor, RetryConfig};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Latest state of one feed as the UI would render it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub name: String,
    pub data: Option<serde_json::Value>,
    pub last_update: Option<DateTime<Utc>>,
    /// Error to display; stays `None` while a cluster transition is underway
    pub error: Option<String>,
    pub consecutive_errors: u32,
}

/// What a single fetch did to the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Updated,
    /// Failed and the error was recorded
    Failed,
    /// Failed during a cluster transition; previous data kept, no error shown
    Suppressed,
    Cancelled,
}

/// Periodic loop fetching one feed through the executor
pub struct FeedPoller {
    feed: FeedConfig,
    request: ApiRequest,
    poll_request: ApiRequest,
    executor: RequestExecutor,
    snapshot: Arc<RwLock<FeedSnapshot>>,
}

impl FeedPoller {
    pub fn new(feed: FeedConfig, base_url: &Url, executor: RequestExecutor) -> Result<Self> {
        let request = ApiRequest::get(endpoint(base_url, &feed.path)?);
        let poll_request = ApiRequest::get(endpoint(base_url, feed.poll_path())?);
        let snapshot = FeedSnapshot {
            name: feed.name.clone(),
            ..FeedSnapshot::default()
        };
        Ok(Self {
            feed,
            request,
            poll_request,
            executor,
            snapshot: Arc::new(RwLock::new(snapshot)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.feed.name
    }

    /// Request for the first load
    #[must_use]
    pub const fn request(&self) -> &ApiRequest {
        &self.request
    }

    /// Request used once the feed holds data
    #[must_use]
    pub const fn poll_request(&self) -> &ApiRequest {
        &self.poll_request
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Fetch once with the given retry budget and fold the result into the snapshot.
    ///
    /// Until the feed holds data the full path is fetched; afterwards the poll
    /// path is fetched and merged according to the feed's [`MergeMode`].
    pub async fn fetch_once(&self, retry: &RetryConfig, cancel: &CancellationToken) -> FetchStatus {
        let loaded = self.snapshot.read().await.data.is_some();
        let request = if loaded {
            &self.poll_request
        } else {
            &self.request
        };

        let result = self.fetch_json(request, retry, cancel).await;
        let mut snapshot = self.snapshot.write().await;

        match result {
            Ok(data) => {
                debug!(feed = %self.feed.name, url = %request.url, "Feed updated");
                let merged = match snapshot.data.take() {
                    Some(held) => merge(held, data, self.feed.merge),
                    None => data,
                };
                snapshot.data = Some(merged);
                snapshot.last_update = Some(Utc::now());
                snapshot.error = None;
                snapshot.consecutive_errors = 0;
                FetchStatus::Updated
            }
            Err(Error::Cancelled) => FetchStatus::Cancelled,
            Err(error) if self.executor.state().is_transitioning() => {
                debug!(
                    feed = %self.feed.name,
                    "Suppressed fetch error during cluster transition: {}", error
                );
                FetchStatus::Suppressed
            }
            Err(error) => {
                warn!(feed = %self.feed.name, "Failed to fetch feed: {}", error);
                snapshot.error = Some(error.to_string());
                snapshot.consecutive_errors += 1;
                FetchStatus::Failed
            }
        }
    }

    /// Initial load with the large budget, then steady-state polling until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            feed = %self.feed.name,
            url = %self.request.url,
            "Starting feed poller (every {}s)", self.feed.interval_secs
        );

        let initial = RetryConfig::from(&self.feed.initial_retry);
        let polling = RetryConfig::from(&self.feed.poll_retry);

        if self.fetch_once(&initial, &cancel).await == FetchStatus::Cancelled {
            return;
        }

        let period = self.feed.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.fetch_once(&polling, &cancel).await == FetchStatus::Cancelled {
                        break;
                    }
                }
            }
        }

        debug!(feed = %self.feed.name, "Feed poller stopped");
    }

    async fn fetch_json(
        &self,
        request: &ApiRequest,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let response = self.executor.execute(request, retry, cancel).await?;
        response.json()
    }
}

/// Fold `incoming` into `held`.
///
/// `PrependById` only applies when both sides are arrays; anything else is
/// replaced. Items without an `id` are compared as whole values.
fn merge(held: Value, incoming: Value, mode: MergeMode) -> Value {
    match (mode, held, incoming) {
        (MergeMode::PrependById, Value::Array(mut items), Value::Array(fresh)) => {
            let mut added: Vec<Value> = Vec::new();
            for item in fresh {
                let id = merge_key(&item);
                if !items.iter().chain(&added).any(|held| merge_key(held) == id) {
                    added.push(item);
                }
            }
            added.append(&mut items);
            Value::Array(added)
        }
        (_, _, incoming) => incoming,
    }
}

fn merge_key(item: &Value) -> &Value {
    item.get("id").unwrap_or(item)
}
