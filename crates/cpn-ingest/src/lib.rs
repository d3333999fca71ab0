//! Ingestion orchestration: one normalize -> resolve -> write pipeline per region.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cpn_core::{normalize, Dimension, FieldMapping, NormalizationError, PricingRecord};
use cpn_feeds::{
    DocumentFeedClient, FeedClient, FeedError, FeedSource, HttpClientConfig, HttpFetcher,
    RegionTask,
};
use cpn_storage::{
    DimensionResolver, FactWriter, PricingStore, StorageError, StorageHandle, TableCounts,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpn-ingest";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub regions_file: PathBuf,
    pub max_concurrency: usize,
    pub db_max_connections: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub deadline_secs: Option<u64>,
    pub reports_dir: PathBuf,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://pricing.db?mode=rwc".to_string()),
            regions_file: lookup("CPN_REGIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("regions.yaml")),
            max_concurrency: lookup("CPN_MAX_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4usize)
                .max(1),
            db_max_connections: lookup("CPN_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8u32)
                .max(1),
            http_timeout_secs: lookup("CPN_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: lookup("CPN_USER_AGENT").unwrap_or_else(|| "cpn-ingest/0.1".to_string()),
            deadline_secs: lookup("CPN_DEADLINE_SECS").and_then(|v| v.parse().ok()),
            reports_dir: lookup("CPN_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("reports")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionRegistry {
    #[serde(default)]
    pub field_mapping: FieldMapping,
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub region_name: String,
    #[serde(default)]
    pub feed_key: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RegionRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Enabled regions as ingestion tasks. Relative feed paths resolve against `base_dir`.
    pub fn region_tasks(&self, base_dir: &Path) -> Result<Vec<RegionTask>> {
        let tasks = self
            .regions
            .iter()
            .filter(|r| r.enabled)
            .map(|r| {
                let source = match (&r.url, &r.path) {
                    (Some(url), None) => FeedSource::Url(url.clone()),
                    (None, Some(path)) => FeedSource::Path(base_dir.join(path)),
                    _ => bail!(
                        "region {:?} must set exactly one of `url` or `path`",
                        r.region_name
                    ),
                };
                Ok(RegionTask {
                    region_name: r.region_name.clone(),
                    feed_key: r.feed_key.clone().unwrap_or_else(|| r.region_name.clone()),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if tasks.is_empty() {
            bail!("region registry has no enabled regions");
        }
        Ok(tasks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FeedUnavailable,
    FeedFormat,
    Storage,
    Cancelled,
    TaskPanicked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionFailure {
    pub region: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFailureKind {
    MissingField,
    MalformedValue,
}

impl From<&NormalizationError> for RecordFailureKind {
    fn from(err: &NormalizationError) -> Self {
        match err {
            NormalizationError::MissingField { .. } => RecordFailureKind::MissingField,
            NormalizationError::MalformedValue { .. } => RecordFailureKind::MalformedValue,
        }
    }
}

/// A feed entry skipped because it failed normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub region: String,
    pub instance_name: Option<String>,
    pub kind: RecordFailureKind,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub regions_succeeded: Vec<String>,
    pub regions_failed: Vec<RegionFailure>,
    pub record_errors: Vec<RecordFailure>,
    pub records_ingested: usize,
}

impl IngestionReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            regions_succeeded: Vec::new(),
            regions_failed: Vec::new(),
            record_errors: Vec::new(),
            records_ingested: 0,
        }
    }

    pub fn failure_for(&self, region: &str) -> Option<&RegionFailure> {
        self.regions_failed.iter().find(|f| f.region == region)
    }

    /// Fold one region's outcome in. Returns the storage error when it is
    /// connection-level and should halt the run.
    fn absorb(&mut self, outcome: RegionOutcome) -> Option<StorageError> {
        self.records_ingested += outcome.records_ingested;
        self.record_errors.extend(outcome.record_errors);

        let (kind, message, fatal) = match outcome.abort {
            None => {
                self.regions_succeeded.push(outcome.region);
                return None;
            }
            Some(RegionAbort::Feed(err)) => {
                let kind = match &err {
                    FeedError::Unavailable { .. } => FailureKind::FeedUnavailable,
                    FeedError::Format { .. } => FailureKind::FeedFormat,
                };
                (kind, err.to_string(), None)
            }
            Some(RegionAbort::Storage(err)) => {
                let message = err.to_string();
                let fatal = err.is_unavailable().then_some(err);
                (FailureKind::Storage, message, fatal)
            }
            Some(RegionAbort::Cancelled(message)) => (FailureKind::Cancelled, message, None),
        };
        self.regions_failed.push(RegionFailure {
            region: outcome.region,
            kind,
            message,
        });
        fatal
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.regions_succeeded.sort();
        self.regions_failed.sort_by(|a, b| a.region.cmp(&b.region));
        self.record_errors.sort_by(|a, b| a.region.cmp(&b.region));
    }

    pub fn summary_markdown(&self) -> String {
        let mut lines = vec![
            "# Pricing Ingestion Summary".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Records ingested: {}", self.records_ingested),
            format!("- Records skipped: {}", self.record_errors.len()),
            String::new(),
            "## Regions Succeeded".to_string(),
        ];
        lines.extend(self.regions_succeeded.iter().map(|r| format!("- {r}")));
        lines.push(String::new());
        lines.push("## Regions Failed".to_string());
        lines.extend(
            self.regions_failed
                .iter()
                .map(|f| format!("- {} ({:?}): {}", f.region, f.kind, f.message)),
        );
        lines.push(String::new());
        lines.join("\n")
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// The shared store went away. Carries everything recorded before the halt.
    #[error("storage unavailable while ingesting {region}: {source}")]
    StorageUnavailable {
        region: String,
        #[source]
        source: StorageError,
        report: Box<IngestionReport>,
    },
}

enum RegionAbort {
    Feed(FeedError),
    Storage(StorageError),
    Cancelled(String),
}

struct RegionOutcome {
    region: String,
    records_ingested: usize,
    record_errors: Vec<RecordFailure>,
    abort: Option<RegionAbort>,
}

#[derive(Clone)]
struct RegionPipeline {
    feeds: Arc<dyn FeedClient>,
    resolver: DimensionResolver,
    writer: FactWriter,
    mapping: Arc<FieldMapping>,
}

impl RegionPipeline {
    async fn run(
        self,
        task: RegionTask,
        limit: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> RegionOutcome {
        let mut outcome = RegionOutcome {
            region: task.region_name.clone(),
            records_ingested: 0,
            record_errors: Vec::new(),
            abort: None,
        };

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.abort = Some(RegionAbort::Cancelled("cancelled before start".into()));
                return outcome;
            }
            permit = limit.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    outcome.abort = Some(RegionAbort::Cancelled("concurrency limiter closed".into()));
                    return outcome;
                }
            },
        };

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            fetched = self.feeds.fetch_region(&task) => Some(fetched),
        };
        let raw_records = match fetched {
            None => {
                outcome.abort = Some(RegionAbort::Cancelled(
                    "cancelled during feed fetch".into(),
                ));
                return outcome;
            }
            Some(Err(err)) => {
                warn!(%err, "feed failed; skipping region");
                outcome.abort = Some(RegionAbort::Feed(err));
                return outcome;
            }
            Some(Ok(records)) => records,
        };

        let total = raw_records.len();
        let mut region_id = None;
        for (index, raw) in raw_records.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.abort = Some(RegionAbort::Cancelled(format!(
                    "cancelled with {} of {total} records unprocessed",
                    total - index
                )));
                break;
            }

            let record = match normalize(raw, &self.mapping) {
                Ok(record) => record,
                Err(err) => {
                    let instance_name = raw.get(&self.mapping.instance_name).cloned();
                    warn!(instance = ?instance_name, %err, "skipping malformed record");
                    outcome.record_errors.push(RecordFailure {
                        region: task.region_name.clone(),
                        instance_name,
                        kind: RecordFailureKind::from(&err),
                        field: err.field().to_string(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            match self.write_record(&task.region_name, &mut region_id, &record).await {
                Ok(()) => outcome.records_ingested += 1,
                Err(err) => {
                    if err.is_unavailable() {
                        cancel.cancel();
                    }
                    warn!(instance = %record.instance_name, %err, "storage failure; aborting region");
                    outcome.abort = Some(RegionAbort::Storage(err));
                    break;
                }
            }
        }

        if outcome.abort.is_none() {
            info!(
                records = outcome.records_ingested,
                skipped = outcome.record_errors.len(),
                "region ingested"
            );
        }
        outcome
    }

    async fn write_record(
        &self,
        region_name: &str,
        cached_region_id: &mut Option<i64>,
        record: &PricingRecord,
    ) -> Result<(), StorageError> {
        let region_id = match *cached_region_id {
            Some(id) => id,
            None => {
                let id = self
                    .resolver
                    .resolve(&Dimension::Region(region_name.to_string()))
                    .await?;
                *cached_region_id = Some(id);
                id
            }
        };
        let vcpu_id = self
            .resolver
            .resolve(&Dimension::VcpuCoreCount(record.vcpu_count))
            .await?;
        let os_id = self
            .resolver
            .resolve(&Dimension::OperatingSystem(record.operating_system.clone()))
            .await?;
        let instance_id = self.writer.write_instance(record, vcpu_id, os_id).await?;
        self.writer
            .write_price(region_id, instance_id, record.price_per_hour)
            .await
    }
}

/// Runs region tasks concurrently against one shared store.
pub struct IngestionCoordinator {
    pipeline: RegionPipeline,
    max_concurrency: usize,
    deadline: Option<Duration>,
}

impl IngestionCoordinator {
    pub fn new(
        feeds: Arc<dyn FeedClient>,
        storage: Arc<dyn StorageHandle>,
        mapping: FieldMapping,
    ) -> Self {
        Self {
            pipeline: RegionPipeline {
                feeds,
                resolver: DimensionResolver::new(storage.clone()),
                writer: FactWriter::new(storage),
                mapping: Arc::new(mapping),
            },
            max_concurrency: 4,
            deadline: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn ingest(&self, tasks: Vec<RegionTask>) -> Result<IngestionReport, IngestError> {
        self.ingest_until_cancelled(tasks, CancellationToken::new())
            .await
    }

    /// Like [`Self::ingest`], but stops early once `cancel` fires. Regions in
    /// flight finish their current record and are reported as cancelled.
    pub async fn ingest_until_cancelled(
        &self,
        tasks: Vec<RegionTask>,
        cancel: CancellationToken,
    ) -> Result<IngestionReport, IngestError> {
        let run_id = Uuid::new_v4();
        let mut report = IngestionReport::new(run_id, Utc::now());
        let run_token = cancel.child_token();
        let limit = Arc::new(Semaphore::new(self.max_concurrency));

        let deadline_timer = self.deadline.map(|deadline| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!(?deadline, "ingestion deadline exceeded; cancelling");
                token.cancel();
            })
        });

        info!(%run_id, regions = tasks.len(), max_concurrency = self.max_concurrency, "ingestion started");
        let handles: Vec<(String, JoinHandle<RegionOutcome>)> = tasks
            .into_iter()
            .map(|task| {
                let region = task.region_name.clone();
                let span = info_span!("region_ingest", region = %region, %run_id);
                let future = self
                    .pipeline
                    .clone()
                    .run(task, limit.clone(), run_token.clone())
                    .instrument(span);
                (region, tokio::spawn(future))
            })
            .collect();

        let mut fatal: Option<(String, StorageError)> = None;
        for (region, handle) in handles {
            match handle.await {
                Ok(outcome) => {
                    if let Some(err) = report.absorb(outcome) {
                        if fatal.is_none() {
                            fatal = Some((region, err));
                        }
                    }
                }
                Err(join_err) => {
                    warn!(%region, %join_err, "region task did not complete");
                    report.regions_failed.push(RegionFailure {
                        region,
                        kind: FailureKind::TaskPanicked,
                        message: join_err.to_string(),
                    });
                }
            }
        }

        if let Some(timer) = deadline_timer {
            timer.abort();
        }
        report.finish();
        info!(
            %run_id,
            succeeded = report.regions_succeeded.len(),
            failed = report.regions_failed.len(),
            records = report.records_ingested,
            "ingestion finished"
        );

        match fatal {
            Some((region, source)) => Err(IngestError::StorageUnavailable {
                region,
                source,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }
}

/// Persist `report` under `<reports_dir>/<run_id>/`; returns that directory.
pub async fn write_report(report: &IngestionReport, reports_dir: &Path) -> Result<PathBuf> {
    let dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing ingestion report")?;
    fs::write(dir.join("ingestion_report.json"), json)
        .await
        .context("writing ingestion_report.json")?;
    fs::write(dir.join("summary.md"), report.summary_markdown())
        .await
        .context("writing summary.md")?;
    Ok(dir)
}

#[derive(Debug, Clone)]
pub struct IngestRunSummary {
    pub report: IngestionReport,
    pub report_dir: PathBuf,
    pub counts: TableCounts,
}

pub async fn run_ingest_from_env() -> Result<IngestRunSummary> {
    run_ingest(IngestConfig::from_env()).await
}

pub async fn run_ingest(config: IngestConfig) -> Result<IngestRunSummary> {
    let registry = RegionRegistry::load(&config.regions_file).await?;
    let base_dir = config
        .regions_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let tasks = registry.region_tasks(&base_dir)?;

    let store = connect_store(&config).await?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.max_concurrency,
    })?;
    let feeds = Arc::new(DocumentFeedClient::new(
        http,
        registry.field_mapping.instance_name.clone(),
    ));
    let mut coordinator = IngestionCoordinator::new(
        feeds,
        Arc::new(store.clone()),
        registry.field_mapping.clone(),
    )
    .with_max_concurrency(config.max_concurrency);
    if let Some(secs) = config.deadline_secs {
        coordinator = coordinator.with_deadline(Duration::from_secs(secs));
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; letting in-flight records finish");
                token.cancel();
            }
        })
    };
    let outcome = coordinator.ingest_until_cancelled(tasks, cancel).await;
    interrupt.abort();

    let report = match outcome {
        Ok(report) => report,
        Err(IngestError::StorageUnavailable {
            region,
            source,
            report,
        }) => {
            let dir = write_report(&report, &config.reports_dir).await?;
            return Err(anyhow::Error::new(source).context(format!(
                "ingestion halted at region {region}; partial report in {}",
                dir.display()
            )));
        }
    };

    let report_dir = write_report(&report, &config.reports_dir).await?;
    let counts = store.counts().await.context("counting pricing rows")?;
    store.close().await;
    Ok(IngestRunSummary {
        report,
        report_dir,
        counts,
    })
}

pub async fn migrate_from_env() -> Result<TableCounts> {
    let config = IngestConfig::from_env();
    let store = connect_store(&config).await?;
    let counts = store.counts().await.context("counting pricing rows")?;
    store.close().await;
    Ok(counts)
}

async fn connect_store(config: &IngestConfig) -> Result<PricingStore> {
    let store = PricingStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to pricing database")?;
    store
        .ensure_schema()
        .await
        .context("ensuring pricing schema")?;
    Ok(store)
}
