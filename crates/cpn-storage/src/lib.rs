//! Relational persistence for CPN: the storage handle contract, its sqlx
//! implementation, and the dimension/fact writers built on top of it.

use std::sync::Arc;

use async_trait::async_trait;
use cpn_core::{Dimension, DimensionKind, PricingRecord};
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "cpn-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    /// A unique constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    /// Connection-level failure; the pool is unusable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("unsupported database url scheme in {0:?}")]
    UnsupportedUrl(String),
}

impl StorageError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StorageError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            _ => StorageError::Query(err.to_string()),
        }
    }
}

/// Positional statement parameter (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<u32> for SqlParam {
    fn from(value: u32) -> Self {
        SqlParam::Int(i64::from(value))
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

/// Minimal parameterized-SQL surface the resolver and fact writer depend on.
///
/// Unique-constraint violations must come back as [`StorageError::Conflict`]
/// so get-or-create can tell a lost race from a real failure.
#[async_trait]
pub trait StorageHandle: Send + Sync {
    /// First column of the first row, read as an integer id.
    async fn query_one(&self, sql: &str, params: &[SqlParam]) -> Result<Option<i64>, StorageError>;

    /// First column of every row, read as integer ids.
    async fn query_ids(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<i64>, StorageError>;

    /// Returns the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(database_url: &str) -> Result<Self, StorageError> {
        let scheme = database_url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            _ => Err(StorageError::UnsupportedUrl(scheme.to_string())),
        }
    }

    fn surrogate_key(self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub regions: i64,
    pub operating_systems: i64,
    pub vcpu_core_counts: i64,
    pub instance_definitions: i64,
    pub region_instance_prices: i64,
}

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

fn bind_params<'q>(mut query: AnyQuery<'q>, params: &[SqlParam]) -> AnyQuery<'q> {
    for param in params {
        query = match param {
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Real(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

/// sqlx-backed store speaking one SQL dialect to PostgreSQL or SQLite.
#[derive(Debug, Clone)]
pub struct PricingStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl PricingStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let dialect = Dialect::from_url(database_url)?;
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        info!(?dialect, max_connections, "connected pricing store");
        Ok(Self { pool, dialect })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create tables and unique indexes if they do not exist yet.
    ///
    /// A dimension index that cannot be built because of pre-existing
    /// duplicate rows is logged and skipped; the resolver tolerates those rows.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let pk = self.dialect.surrogate_key();
        let tables = [
            format!("CREATE TABLE IF NOT EXISTS regions (id {pk}, long_name TEXT NOT NULL)"),
            format!("CREATE TABLE IF NOT EXISTS operating_systems (id {pk}, name TEXT NOT NULL)"),
            format!(
                "CREATE TABLE IF NOT EXISTS vcpu_core_counts (id {pk}, core_count BIGINT NOT NULL)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS instance_definitions (
                    id {pk},
                    instance_name TEXT NOT NULL,
                    vcpu_id BIGINT NOT NULL REFERENCES vcpu_core_counts (id),
                    memory_gib DOUBLE PRECISION NOT NULL,
                    storage TEXT NOT NULL,
                    network_performance TEXT NOT NULL,
                    operating_system_id BIGINT NOT NULL REFERENCES operating_systems (id)
                )"
            ),
            "CREATE TABLE IF NOT EXISTS region_instance_prices (
                region_id BIGINT NOT NULL REFERENCES regions (id),
                instance_id BIGINT NOT NULL REFERENCES instance_definitions (id),
                price_per_hour DOUBLE PRECISION NOT NULL
            )"
            .to_string(),
        ];
        for ddl in &tables {
            self.execute(ddl, &[]).await?;
        }

        for kind in [
            DimensionKind::Region,
            DimensionKind::OperatingSystem,
            DimensionKind::VcpuCoreCount,
        ] {
            match self.execute(dimension_statements(kind).unique_index, &[]).await {
                Ok(_) => {}
                Err(StorageError::Conflict(message)) => {
                    warn!(%kind, %message, "duplicate dimension rows prevent unique index; continuing without it");
                }
                Err(err) => return Err(err),
            }
        }

        self.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS instance_definitions_instance_name_key \
             ON instance_definitions (instance_name)",
            &[],
        )
        .await?;
        self.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS region_instance_prices_pair_key \
             ON region_instance_prices (region_id, instance_id)",
            &[],
        )
        .await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<TableCounts, StorageError> {
        let count = |table: &'static str| async move {
            self.query_one(&format!("SELECT COUNT(*) FROM {table}"), &[])
                .await
                .map(|n| n.unwrap_or_default())
        };
        Ok(TableCounts {
            regions: count("regions").await?,
            operating_systems: count("operating_systems").await?,
            vcpu_core_counts: count("vcpu_core_counts").await?,
            instance_definitions: count("instance_definitions").await?,
            region_instance_prices: count("region_instance_prices").await?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageHandle for PricingStore {
    async fn query_one(&self, sql: &str, params: &[SqlParam]) -> Result<Option<i64>, StorageError> {
        let row = bind_params(sqlx::query(sql), params)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<i64, _>(0))
            .transpose()
            .map_err(StorageError::from)
    }

    async fn query_ids(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<i64>, StorageError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>(0).map_err(StorageError::from))
            .collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StorageError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

struct DimensionStatements {
    lookup: &'static str,
    insert: &'static str,
    unique_index: &'static str,
}

fn dimension_statements(kind: DimensionKind) -> DimensionStatements {
    match kind {
        DimensionKind::Region => DimensionStatements {
            lookup: "SELECT id FROM regions WHERE long_name = $1 ORDER BY id DESC LIMIT 2",
            insert: "INSERT INTO regions (long_name) VALUES ($1) RETURNING id",
            unique_index: "CREATE UNIQUE INDEX IF NOT EXISTS regions_long_name_key ON regions (long_name)",
        },
        DimensionKind::OperatingSystem => DimensionStatements {
            lookup: "SELECT id FROM operating_systems WHERE name = $1 ORDER BY id DESC LIMIT 2",
            insert: "INSERT INTO operating_systems (name) VALUES ($1) RETURNING id",
            unique_index:
                "CREATE UNIQUE INDEX IF NOT EXISTS operating_systems_name_key ON operating_systems (name)",
        },
        DimensionKind::VcpuCoreCount => DimensionStatements {
            lookup: "SELECT id FROM vcpu_core_counts WHERE core_count = $1 ORDER BY id DESC LIMIT 2",
            insert: "INSERT INTO vcpu_core_counts (core_count) VALUES ($1) RETURNING id",
            unique_index: "CREATE UNIQUE INDEX IF NOT EXISTS vcpu_core_counts_core_count_key \
                           ON vcpu_core_counts (core_count)",
        },
    }
}

fn natural_key(dimension: &Dimension) -> SqlParam {
    match dimension {
        Dimension::Region(name) | Dimension::OperatingSystem(name) => SqlParam::from(name.as_str()),
        Dimension::VcpuCoreCount(count) => SqlParam::from(*count),
    }
}

/// Maps dimension natural keys to surrogate ids, creating rows on first sight.
#[derive(Clone)]
pub struct DimensionResolver {
    storage: Arc<dyn StorageHandle>,
}

impl DimensionResolver {
    pub fn new(storage: Arc<dyn StorageHandle>) -> Self {
        Self { storage }
    }

    /// Get-or-create. Concurrent callers racing on the same key all receive the
    /// id of the single row the unique index let through.
    pub async fn resolve(&self, dimension: &Dimension) -> Result<i64, StorageError> {
        let statements = dimension_statements(dimension.kind());
        let key = natural_key(dimension);

        if let Some(id) = self.lookup(&statements, dimension, &key).await? {
            return Ok(id);
        }

        match self.storage.query_one(statements.insert, &[key.clone()]).await {
            Ok(Some(id)) => {
                debug!(%dimension, id, "dimension created");
                Ok(id)
            }
            Ok(None) => Err(StorageError::Query(format!(
                "insert of {dimension} returned no id"
            ))),
            Err(StorageError::Conflict(message)) => {
                debug!(%dimension, %message, "concurrent insert won; reading back");
                self.lookup(&statements, dimension, &key)
                    .await?
                    .ok_or_else(|| {
                        StorageError::Query(format!(
                            "{dimension} conflicted on insert but is not readable: {message}"
                        ))
                    })
            }
            Err(err) => Err(err),
        }
    }

    async fn lookup(
        &self,
        statements: &DimensionStatements,
        dimension: &Dimension,
        key: &SqlParam,
    ) -> Result<Option<i64>, StorageError> {
        let ids = self
            .storage
            .query_ids(statements.lookup, std::slice::from_ref(key))
            .await?;
        if ids.len() > 1 {
            warn!(%dimension, chosen_id = ids[0], "duplicate dimension rows; using most recent");
        }
        Ok(ids.first().copied())
    }
}

/// Upserts instance definitions and region prices.
#[derive(Clone)]
pub struct FactWriter {
    storage: Arc<dyn StorageHandle>,
}

impl FactWriter {
    pub fn new(storage: Arc<dyn StorageHandle>) -> Self {
        Self { storage }
    }

    /// Insert or update the definition keyed on `instance_name`; returns its stable id.
    pub async fn write_instance(
        &self,
        record: &PricingRecord,
        vcpu_id: i64,
        operating_system_id: i64,
    ) -> Result<i64, StorageError> {
        let params = [
            SqlParam::from(record.instance_name.as_str()),
            SqlParam::from(vcpu_id),
            SqlParam::from(record.memory_gib),
            SqlParam::from(record.storage.as_str()),
            SqlParam::from(record.network_performance.as_str()),
            SqlParam::from(operating_system_id),
        ];
        self.storage
            .query_one(
                "INSERT INTO instance_definitions
                    (instance_name, vcpu_id, memory_gib, storage, network_performance, operating_system_id)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (instance_name) DO UPDATE SET
                    vcpu_id = excluded.vcpu_id,
                    memory_gib = excluded.memory_gib,
                    storage = excluded.storage,
                    network_performance = excluded.network_performance,
                    operating_system_id = excluded.operating_system_id
                 RETURNING id",
                &params,
            )
            .await?
            .ok_or_else(|| {
                StorageError::Query(format!(
                    "upsert of instance {} returned no id",
                    record.instance_name
                ))
            })
    }

    pub async fn write_price(
        &self,
        region_id: i64,
        instance_id: i64,
        price_per_hour: f64,
    ) -> Result<(), StorageError> {
        self.storage
            .execute(
                "INSERT INTO region_instance_prices (region_id, instance_id, price_per_hour)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (region_id, instance_id) DO UPDATE SET
                    price_per_hour = excluded.price_per_hour",
                &[
                    SqlParam::from(region_id),
                    SqlParam::from(instance_id),
                    SqlParam::from(price_per_hour),
                ],
            )
            .await?;
        Ok(())
    }
}
