use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpn_core::{FieldMapping, RawRecord};
use cpn_feeds::{FeedClient, FeedError, FeedSource, RegionTask};
use cpn_ingest::{write_report, FailureKind, IngestError, IngestionCoordinator, RecordFailureKind};
use cpn_storage::{PricingStore, SqlParam, StorageError, StorageHandle, TableCounts};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

/// Serves canned records per region, optionally after a delay.
#[derive(Default)]
struct StaticFeeds {
    regions: HashMap<String, Result<Vec<RawRecord>, FeedError>>,
    delay: Option<Duration>,
}

impl StaticFeeds {
    fn with_region(mut self, region: &str, records: Vec<RawRecord>) -> Self {
        self.regions.insert(region.to_string(), Ok(records));
        self
    }

    fn with_failure(mut self, region: &str) -> Self {
        self.regions.insert(
            region.to_string(),
            Err(FeedError::Unavailable {
                region: region.to_string(),
                reason: "connection refused".into(),
            }),
        );
        self
    }
}

#[async_trait]
impl FeedClient for StaticFeeds {
    async fn fetch_region(&self, task: &RegionTask) -> Result<Vec<RawRecord>, FeedError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.regions
            .get(&task.region_name)
            .cloned()
            .unwrap_or_else(|| {
                Err(FeedError::Format {
                    region: task.region_name.clone(),
                    reason: "no such region".into(),
                })
            })
    }
}

/// A store whose connection is gone.
struct DeadStorage;

#[async_trait]
impl StorageHandle for DeadStorage {
    async fn query_one(&self, _: &str, _: &[SqlParam]) -> Result<Option<i64>, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }

    async fn query_ids(&self, _: &str, _: &[SqlParam]) -> Result<Vec<i64>, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }

    async fn execute(&self, _: &str, _: &[SqlParam]) -> Result<u64, StorageError> {
        Err(StorageError::Unavailable("connection reset".into()))
    }
}

/// What happens once the allowed number of price rows has been written.
enum AfterLimit {
    Cancel(CancellationToken),
    Fail,
}

/// Wraps a real store and stops a region after `limit` price writes.
struct LimitedStorage {
    inner: PricingStore,
    limit: usize,
    after_limit: AfterLimit,
    price_writes: AtomicUsize,
}

impl LimitedStorage {
    fn new(inner: PricingStore, limit: usize, after_limit: AfterLimit) -> Self {
        Self {
            inner,
            limit,
            after_limit,
            price_writes: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        let exhausted = self.price_writes.load(Ordering::SeqCst) >= self.limit;
        match self.after_limit {
            AfterLimit::Fail if exhausted => Err(StorageError::Query("disk full".into())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StorageHandle for LimitedStorage {
    async fn query_one(&self, sql: &str, params: &[SqlParam]) -> Result<Option<i64>, StorageError> {
        self.check()?;
        self.inner.query_one(sql, params).await
    }

    async fn query_ids(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<i64>, StorageError> {
        self.check()?;
        self.inner.query_ids(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StorageError> {
        self.check()?;
        let affected = self.inner.execute(sql, params).await?;
        if sql.contains("INSERT INTO region_instance_prices") {
            let written = self.price_writes.fetch_add(1, Ordering::SeqCst) + 1;
            if let AfterLimit::Cancel(token) = &self.after_limit {
                if written == self.limit {
                    token.cancel();
                }
            }
        }
        Ok(affected)
    }
}

fn raw(name: &str, vcpu: &str, memory: &str, price: &str) -> RawRecord {
    [
        ("Instance Name", name),
        ("Memory", memory),
        ("Storage", "EBS only"),
        ("Network Performance", "Up to 5 Gigabit"),
        ("Operating System", "Linux"),
        ("vCPU", vcpu),
        ("price", price),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn catalog() -> Vec<RawRecord> {
    vec![
        raw("t3.micro", "2", "1 GiB", "$0.0120"),
        raw("t3.medium", "2", "4 GiB", "$0.0480"),
        raw("m5.xlarge", "4", "16 GiB", "$0.2300"),
    ]
}

fn task(region: &str) -> RegionTask {
    RegionTask {
        region_name: region.to_string(),
        feed_key: region.to_string(),
        source: FeedSource::Url(format!("https://pricing.example.com/{region}.json")),
    }
}

async fn temp_store() -> (TempDir, PricingStore) {
    let dir = tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("pricing.db").display());
    let store = PricingStore::connect(&url, 8).await.expect("connect");
    store.ensure_schema().await.expect("schema");
    (dir, store)
}

fn coordinator(feeds: StaticFeeds, store: &PricingStore) -> IngestionCoordinator {
    IngestionCoordinator::new(
        Arc::new(feeds),
        Arc::new(store.clone()),
        FieldMapping::default(),
    )
}

async fn prices(store: &PricingStore) -> Vec<(String, String, f64)> {
    sqlx::query_as(
        "SELECT r.long_name, i.instance_name, p.price_per_hour
           FROM region_instance_prices p
           JOIN regions r ON r.id = p.region_id
           JOIN instance_definitions i ON i.id = p.instance_id
          ORDER BY r.long_name, i.instance_name",
    )
    .fetch_all(store.pool())
    .await
    .expect("prices")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reingesting_a_region_is_idempotent() {
    let (_dir, store) = temp_store().await;
    let coordinator = coordinator(
        StaticFeeds::default().with_region("EU (Frankfurt)", catalog()),
        &store,
    );

    let first = coordinator.ingest(vec![task("EU (Frankfurt)")]).await.expect("first");
    let counts_after_first = store.counts().await.expect("counts");
    let prices_after_first = prices(&store).await;

    let second = coordinator.ingest(vec![task("EU (Frankfurt)")]).await.expect("second");
    assert_eq!(first.records_ingested, 3);
    assert_eq!(second.records_ingested, 3);
    assert_eq!(store.counts().await.expect("counts"), counts_after_first);
    assert_eq!(prices(&store).await, prices_after_first);
    assert_eq!(
        counts_after_first,
        TableCounts {
            regions: 1,
            operating_systems: 1,
            vcpu_core_counts: 2,
            instance_definitions: 3,
            region_instance_prices: 3,
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failing_feed_does_not_affect_other_regions() {
    let (_dir, store) = temp_store().await;
    let coordinator = coordinator(
        StaticFeeds::default()
            .with_region("EU (Frankfurt)", catalog())
            .with_failure("EU (Ireland)")
            .with_region("EU (Paris)", catalog()),
        &store,
    );

    let report = coordinator
        .ingest(vec![task("EU (Frankfurt)"), task("EU (Ireland)"), task("EU (Paris)")])
        .await
        .expect("report");

    assert_eq!(report.regions_succeeded, vec!["EU (Frankfurt)", "EU (Paris)"]);
    assert_eq!(report.regions_failed.len(), 1);
    assert_eq!(
        report.failure_for("EU (Ireland)").map(|f| f.kind),
        Some(FailureKind::FeedUnavailable)
    );
    assert_eq!(report.records_ingested, 6);

    let rows = prices(&store).await;
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|(region, _, _)| region != "EU (Ireland)"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_records_are_skipped_and_reported() {
    let (_dir, store) = temp_store().await;
    let mut records = catalog();
    records.insert(1, raw("x1.broken", "4", "512 MiB", "$1.00"));
    let mut no_price = raw("c5.noprice", "4", "8 GiB", "$0.10");
    no_price.remove("price");
    records.push(no_price);
    let coordinator = coordinator(
        StaticFeeds::default().with_region("EU (Milan)", records),
        &store,
    );

    let report = coordinator.ingest(vec![task("EU (Milan)")]).await.expect("report");

    assert_eq!(report.regions_succeeded, vec!["EU (Milan)"]);
    assert_eq!(report.records_ingested, 3);
    assert_eq!(report.record_errors.len(), 2);
    let malformed = report
        .record_errors
        .iter()
        .find(|e| e.instance_name.as_deref() == Some("x1.broken"))
        .expect("x1.broken reported");
    assert_eq!(malformed.kind, RecordFailureKind::MalformedValue);
    assert_eq!(malformed.field, "Memory");
    let missing = report
        .record_errors
        .iter()
        .find(|e| e.instance_name.as_deref() == Some("c5.noprice"))
        .expect("c5.noprice reported");
    assert_eq!(missing.kind, RecordFailureKind::MissingField);
    assert_eq!(missing.field, "price");
    assert_eq!(store.counts().await.expect("counts").instance_definitions, 3);
}

#[tokio::test]
async fn cancellation_between_records_keeps_finished_records() {
    let (_dir, store) = temp_store().await;
    let cancel = CancellationToken::new();
    let coordinator = IngestionCoordinator::new(
        Arc::new(StaticFeeds::default().with_region("EU (Frankfurt)", catalog())),
        Arc::new(LimitedStorage::new(
            store.clone(),
            2,
            AfterLimit::Cancel(cancel.clone()),
        )),
        FieldMapping::default(),
    );

    let report = coordinator
        .ingest_until_cancelled(vec![task("EU (Frankfurt)")], cancel)
        .await
        .expect("report");

    assert_eq!(report.records_ingested, 2);
    assert!(report.regions_succeeded.is_empty());
    let failure = report.failure_for("EU (Frankfurt)").expect("failure");
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert!(failure.message.contains("1 of 3"), "{}", failure.message);

    let rows = prices(&store).await;
    assert_eq!(
        rows.iter().map(|(_, name, _)| name.as_str()).collect::<Vec<_>>(),
        vec!["t3.medium", "t3.micro"]
    );
    assert_eq!(store.counts().await.expect("counts").instance_definitions, 2);
}

#[tokio::test]
async fn storage_failure_midway_keeps_committed_records() {
    let (_dir, store) = temp_store().await;
    let coordinator = IngestionCoordinator::new(
        Arc::new(StaticFeeds::default().with_region("EU (Frankfurt)", catalog())),
        Arc::new(LimitedStorage::new(store.clone(), 1, AfterLimit::Fail)),
        FieldMapping::default(),
    );

    let report = coordinator
        .ingest(vec![task("EU (Frankfurt)")])
        .await
        .expect("non-fatal storage errors still produce a report");

    assert_eq!(report.records_ingested, 1);
    assert_eq!(
        report.failure_for("EU (Frankfurt)").map(|f| f.kind),
        Some(FailureKind::Storage)
    );
    assert_eq!(
        prices(&store).await,
        vec![("EU (Frankfurt)".to_string(), "t3.micro".to_string(), 0.012)]
    );
    assert_eq!(store.counts().await.expect("counts").instance_definitions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_regions_share_dimension_rows() {
    let (_dir, store) = temp_store().await;
    let regions = [
        "EU (Frankfurt)",
        "EU (Ireland)",
        "EU (London)",
        "EU (Milan)",
        "EU (Paris)",
        "EU (Stockholm)",
    ];
    let feeds = regions
        .iter()
        .fold(StaticFeeds::default(), |feeds, r| feeds.with_region(r, catalog()));
    let coordinator = coordinator(feeds, &store).with_max_concurrency(regions.len());

    let report = coordinator
        .ingest(regions.iter().map(|r| task(r)).collect())
        .await
        .expect("report");

    assert_eq!(report.regions_succeeded.len(), regions.len());
    assert_eq!(
        store.counts().await.expect("counts"),
        TableCounts {
            regions: 6,
            operating_systems: 1,
            vcpu_core_counts: 2,
            instance_definitions: 3,
            region_instance_prices: 18,
        }
    );
}

#[tokio::test]
async fn dead_storage_halts_the_run_with_a_partial_report() {
    let coordinator = IngestionCoordinator::new(
        Arc::new(
            StaticFeeds::default()
                .with_region("EU (Frankfurt)", catalog())
                .with_region("EU (Paris)", catalog()),
        ),
        Arc::new(DeadStorage),
        FieldMapping::default(),
    );

    let err = coordinator
        .ingest(vec![task("EU (Frankfurt)"), task("EU (Paris)")])
        .await
        .unwrap_err();

    let IngestError::StorageUnavailable { source, report, .. } = err;
    assert!(source.is_unavailable());
    assert_eq!(report.records_ingested, 0);
    assert!(report.regions_succeeded.is_empty());
    assert_eq!(report.regions_failed.len(), 2);
}

#[tokio::test]
async fn cancelled_runs_report_every_region_as_cancelled() {
    let (_dir, store) = temp_store().await;
    let coordinator = coordinator(
        StaticFeeds::default()
            .with_region("EU (Frankfurt)", catalog())
            .with_region("EU (Paris)", catalog()),
        &store,
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = coordinator
        .ingest_until_cancelled(vec![task("EU (Frankfurt)"), task("EU (Paris)")], cancel)
        .await
        .expect("report");

    assert!(report.regions_succeeded.is_empty());
    assert!(report
        .regions_failed
        .iter()
        .all(|f| f.kind == FailureKind::Cancelled));
    assert_eq!(store.counts().await.expect("counts"), TableCounts::default());
}

#[tokio::test]
async fn deadline_cancels_slow_feeds() {
    let (_dir, store) = temp_store().await;
    let feeds = StaticFeeds {
        delay: Some(Duration::from_secs(30)),
        ..StaticFeeds::default()
    }
    .with_region("EU (Zurich)", catalog());
    let coordinator = coordinator(feeds, &store).with_deadline(Duration::from_millis(50));

    let report = coordinator.ingest(vec![task("EU (Zurich)")]).await.expect("report");

    assert_eq!(
        report.failure_for("EU (Zurich)").map(|f| f.kind),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(report.records_ingested, 0);
}

#[tokio::test]
async fn reports_are_written_per_run() {
    let (_dir, store) = temp_store().await;
    let coordinator = coordinator(
        StaticFeeds::default().with_region("EU (Spain)", catalog()),
        &store,
    );
    let report = coordinator.ingest(vec![task("EU (Spain)")]).await.expect("report");

    let reports = tempdir().expect("reports dir");
    let dir = write_report(&report, reports.path()).await.expect("write");

    assert!(dir.ends_with(report.run_id.to_string()));
    let json: serde_json::Value = serde_json::from_slice(
        &std::fs::read(dir.join("ingestion_report.json")).expect("read json"),
    )
    .expect("parse json");
    assert_eq!(json["records_ingested"], 3);
    assert_eq!(json["record_errors"], serde_json::json!([]));
    assert_eq!(json["regions_succeeded"][0], "EU (Spain)");
    assert!(dir.join("summary.md").exists());
}
