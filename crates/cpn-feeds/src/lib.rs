//! Pricing feed clients: fetch one region's document and flatten it into raw records.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cpn_core::RawRecord;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "cpn-feeds";

/// Where a region's feed document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Url(String),
    Path(PathBuf),
}

/// One unit of ingestion work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTask {
    /// Long region name stored in the `regions` dimension, e.g. "EU (Frankfurt)".
    pub region_name: String,
    /// Key of this region under `regions` in the feed document.
    pub feed_key: String,
    pub source: FeedSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("feed unavailable for {region}: {reason}")]
    Unavailable { region: String, reason: String },
    #[error("unexpected feed format for {region}: {reason}")]
    Format { region: String, reason: String },
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_region(&self, task: &RegionTask) -> Result<Vec<RawRecord>, FeedError>;
}

#[derive(Debug, Deserialize)]
struct FeedDocument {
    regions: BTreeMap<String, BTreeMap<String, BTreeMap<String, JsonValue>>>,
}

/// Pull `regions[feed_key]` out of a feed document. The instance name (the map
/// key) is stored under `instance_name_key` unless the entry already carries it.
pub fn extract_region_records(
    body: &[u8],
    task: &RegionTask,
    instance_name_key: &str,
) -> Result<Vec<RawRecord>, FeedError> {
    let document: FeedDocument =
        serde_json::from_slice(body).map_err(|err| FeedError::Format {
            region: task.region_name.clone(),
            reason: err.to_string(),
        })?;

    let Some(instances) = document.regions.get(&task.feed_key) else {
        let available = document.regions.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(FeedError::Format {
            region: task.region_name.clone(),
            reason: format!("feed key {:?} not found (available: {available})", task.feed_key),
        });
    };

    Ok(instances
        .iter()
        .map(|(instance_name, attributes)| {
            let mut record: RawRecord = attributes
                .iter()
                .filter_map(|(k, v)| scalar_text(v).map(|text| (k.clone(), text)))
                .collect();
            record
                .entry(instance_name_key.to_string())
                .or_insert_with(|| instance_name.clone());
            record
        })
        .collect())
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http fetcher is shut down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// GET `url` and return the body of a 2xx response. Single attempt.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Reads feeds over HTTP or from local JSON files, depending on [`FeedSource`].
#[derive(Debug)]
pub struct DocumentFeedClient {
    http: HttpFetcher,
    instance_name_key: String,
}

impl DocumentFeedClient {
    pub fn new(http: HttpFetcher, instance_name_key: impl Into<String>) -> Self {
        Self {
            http,
            instance_name_key: instance_name_key.into(),
        }
    }

    async fn read_source(&self, task: &RegionTask) -> Result<Vec<u8>, FeedError> {
        let unavailable = |reason: String| FeedError::Unavailable {
            region: task.region_name.clone(),
            reason,
        };
        match &task.source {
            FeedSource::Url(url) => self
                .http
                .fetch_bytes(url)
                .await
                .map_err(|err| unavailable(err.to_string())),
            FeedSource::Path(path) => fs::read(path)
                .await
                .map_err(|err| unavailable(format!("reading {}: {err}", path.display()))),
        }
    }
}

#[async_trait]
impl FeedClient for DocumentFeedClient {
    async fn fetch_region(&self, task: &RegionTask) -> Result<Vec<RawRecord>, FeedError> {
        let span = info_span!("feed_fetch", region = %task.region_name);
        async {
            let body = self.read_source(task).await?;
            let records = extract_region_records(&body, task, &self.instance_name_key)?;
            debug!(bytes = body.len(), records = records.len(), "feed parsed");
            Ok::<_, FeedError>(records)
        }
        .instrument(span)
        .await
    }
}
