//! Lake + warehouse persistence, raw payload archival and HTTP fetch utilities.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use oculus_core::{PipelineError, PipelineResult};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

mod archive;
mod dimensions;
mod fetch;
mod lake;
mod warehouse;
mod watermark;

pub use archive::{ArchivedPayload, PayloadArchive};
pub use dimensions::DimensionResolver;
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedJson,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use lake::LakeWriter;
pub use warehouse::{DeadLetter, TrainingRow, Warehouse, WarehouseBatch};
pub use watermark::{SyncWatermark, WatermarkTracker};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn for_path(path: impl AsRef<Path>) -> Self {
        Self::new(format!("sqlite://{}", path.as_ref().display()))
    }
}

/// Handle on the SQLite database holding the lake, the warehouse and the
/// reconciliation bookkeeping. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(config: &StoreConfig) -> PipelineResult<Self> {
        let opts = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(map_db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(opts)
            .await
            .map_err(map_db_err)?;
        info!(database_url = %config.database_url, "store connected");
        Ok(Self { pool })
    }

    /// Connect and bring the schema up to date.
    pub async fn open(config: &StoreConfig) -> PipelineResult<Self> {
        let store = Self::connect(config).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> PipelineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| PipelineError::StorageUnavailable(format!("migration failed: {err}")))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn lake(&self) -> LakeWriter {
        LakeWriter::new(self.pool.clone())
    }

    pub fn warehouse(&self) -> Warehouse {
        Warehouse::new(self.pool.clone())
    }

    pub fn watermarks(&self) -> WatermarkTracker {
        WatermarkTracker::new(self.pool.clone())
    }

    /// A fresh resolver with its own key cache. Share one instance across
    /// concurrent reconciliations so per-family serialization applies.
    pub fn resolver(&self) -> DimensionResolver {
        DimensionResolver::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Classify a database error into the pipeline taxonomy: integrity
/// violations are row-level, everything else is treated as transient.
pub fn map_db_err(err: sqlx::Error) -> PipelineError {
    if let Some(db_err) = err.as_database_error() {
        match db_err.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => {
                return PipelineError::ConstraintViolation(db_err.message().to_string());
            }
            _ => {}
        }
    }
    PipelineError::StorageUnavailable(err.to_string())
}

/// Bound a storage operation; an elapsed deadline is a retryable failure.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::StorageUnavailable(format!(
            "{what} timed out after {limit:?}"
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_rerunnable() {
        let (_dir, store) = testing::temp_store().await;
        store.migrate().await.expect("second migrate");
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'dim_%'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(tables, 9);
    }

    #[tokio::test]
    async fn timeouts_become_retryable_failures() {
        let err = with_timeout(Duration::from_millis(5), "slow op", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, PipelineError>(())
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("slow op timed out"));
    }
}
