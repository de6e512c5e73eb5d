//! Pipeline orchestration: runtime configuration, the marketplace registry,
//! and the two externally triggered jobs (`ingest`, `reconcile_all`).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use oculus_adapters::{
    FixtureSource, GebrauchtwagenSource, ListingSource, SearchCriteria, WillhabenSource,
};
use oculus_core::{LakeTable, Marketplace, PricePredictor};
use oculus_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, PayloadArchive, Store, StoreConfig,
};
use serde::Deserialize;
use tokio::fs;
use tokio::sync::watch;
use tracing::info;

mod export;
mod ingest;
mod reconcile;

pub use export::{export_training_features, ParquetManifest, ParquetManifestFile};
pub use ingest::{IngestSummary, MarketplaceIngest};
pub use reconcile::{BatchResult, ReconcileOptions, Reconciler};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Live,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub marketplace: Marketplace,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    /// Directory of captured search pages, relative to the workspace root.
    /// Defaults to `fixtures/<marketplace>`.
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

fn default_page_size() -> usize {
    200
}

fn default_max_pages() -> usize {
    10
}

fn default_request_interval_ms() -> u64 {
    5_000
}

impl SourceConfig {
    pub fn criteria(&self, window_hours: u32) -> SearchCriteria {
        SearchCriteria {
            window_hours,
            page_size: self.page_size,
            max_pages: self.max_pages,
        }
    }
}

/// An enabled marketplace together with the source that serves it.
#[derive(Clone)]
pub struct RegisteredSource {
    pub config: SourceConfig,
    pub source: Arc<dyn ListingSource>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub db_timeout_secs: u64,
    pub batch_size: usize,
    pub max_batch_retries: usize,
    pub db_max_connections: u32,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./oculus.db".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            workspace_root: std::env::var("OCULUS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("OCULUS_USER_AGENT")
                .unwrap_or_else(|_| "oculus-bot/0.1".to_string()),
            http_timeout_secs: env_or("OCULUS_HTTP_TIMEOUT_SECS", 20),
            db_timeout_secs: env_or("OCULUS_DB_TIMEOUT_SECS", 30),
            batch_size: env_or("OCULUS_BATCH_SIZE", 500),
            max_batch_retries: env_or("OCULUS_MAX_BATCH_RETRIES", 3),
            db_max_connections: env_or("OCULUS_DB_MAX_CONNECTIONS", 4),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_connections: self.db_max_connections,
            ..StoreConfig::new(&self.database_url)
        }
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs.max(1))
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            batch_size: self.batch_size.max(1),
            db_timeout: self.db_timeout(),
            backoff: BackoffPolicy {
                max_retries: self.max_batch_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Store,
    archive: PayloadArchive,
    predictor: Option<Arc<dyn PricePredictor>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Store) -> Self {
        let archive = PayloadArchive::new(config.artifacts_dir.clone());
        Self {
            config,
            store,
            archive,
            predictor: None,
        }
    }

    /// Open the configured database (migrating it) and build a pipeline on it.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = Store::open(&config.store_config())
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        Ok(Self::new(config, store))
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn PricePredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Instantiate a listing source for every enabled registry entry. Live
    /// sources get their own fetcher so request pacing is per marketplace.
    pub fn build_sources(&self, registry: &SourceRegistry) -> Result<Vec<RegisteredSource>> {
        let mut out = Vec::new();
        for config in registry.sources.iter().filter(|s| s.enabled) {
            let source: Arc<dyn ListingSource> = match config.mode {
                SourceMode::Fixture => {
                    let rel = config
                        .fixture_path
                        .clone()
                        .unwrap_or_else(|| PathBuf::from("fixtures").join(config.marketplace.as_str()));
                    Arc::new(FixtureSource::new(
                        config.marketplace,
                        self.config.workspace_root.join(rel),
                    ))
                }
                SourceMode::Live => {
                    let Some(base_url) = config.base_url.clone() else {
                        bail!("live source {} has no base_url", config.marketplace);
                    };
                    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
                        timeout: Duration::from_secs(self.config.http_timeout_secs),
                        user_agent: Some(self.config.user_agent.clone()),
                        min_request_interval: Duration::from_millis(config.request_interval_ms),
                        ..Default::default()
                    })?);
                    match config.marketplace {
                        Marketplace::Willhaben => Arc::new(WillhabenSource::new(http, base_url)),
                        Marketplace::Gebrauchtwagen => {
                            Arc::new(GebrauchtwagenSource::new(http, base_url))
                        }
                    }
                }
            };
            info!(
                marketplace = %config.marketplace,
                display_name = %config.display_name,
                mode = ?config.mode,
                "source registered"
            );
            out.push(RegisteredSource {
                config: config.clone(),
                source,
            });
        }
        Ok(out)
    }

    pub fn reconciler(&self, shutdown: watch::Receiver<bool>) -> Reconciler {
        let reconciler = Reconciler::new(self.store.clone(), self.config.reconcile_options())
            .with_shutdown(shutdown);
        match &self.predictor {
            Some(predictor) => reconciler.with_predictor(predictor.clone()),
            None => reconciler,
        }
    }

    /// Reconcile every lake table concurrently. Fails if any table failed;
    /// tables that succeeded keep their committed progress.
    pub async fn reconcile_all(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<BatchResult>> {
        let reconciler = self.reconciler(shutdown);
        let results = reconciler.reconcile_all().await;
        let mut out = Vec::with_capacity(results.len());
        for (table, result) in LakeTable::ALL.into_iter().zip(results) {
            out.push(result.with_context(|| format!("reconciling {table}"))?);
        }
        Ok(out)
    }

    pub async fn export_features(&self, dir: impl Into<PathBuf>) -> Result<PathBuf> {
        export_training_features(&self.store.warehouse(), &dir.into()).await
    }

    pub async fn requeue_dead_letters(&self, table: LakeTable) -> Result<u64> {
        let requeued = self
            .store
            .lake()
            .requeue_dead_letters(table)
            .await
            .with_context(|| format!("requeueing dead letters of {table}"))?;
        info!(%table, requeued, "dead letters requeued");
        Ok(requeued)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    pub fn test_config(dir: &Path) -> SyncConfig {
        SyncConfig {
            database_url: format!("sqlite://{}", dir.join("oculus.db").display()),
            artifacts_dir: dir.join("artifacts"),
            workspace_root: workspace_root(),
            user_agent: "oculus-test".to_string(),
            http_timeout_secs: 5,
            db_timeout_secs: 30,
            batch_size: 500,
            max_batch_retries: 0,
            db_max_connections: 4,
        }
    }

    pub async fn pipeline_with(config: SyncConfig) -> SyncPipeline {
        SyncPipeline::connect(config).await.expect("connect pipeline")
    }

    pub async fn fixture_pipeline() -> (TempDir, SyncPipeline) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline_with(test_config(dir.path())).await;
        (dir, pipeline)
    }

    pub fn fixture_registry() -> SourceRegistry {
        serde_yaml::from_str(
            r#"
sources:
  - marketplace: willhaben
    display_name: willhaben.at
    enabled: true
    mode: fixture
  - marketplace: gebrauchtwagen
    display_name: gebrauchtwagen.at
    enabled: true
    mode: fixture
"#,
        )
        .expect("registry yaml")
    }

    /// Ingest both fixture marketplaces into the pipeline's lake.
    pub async fn ingest_fixtures(pipeline: &SyncPipeline) -> IngestSummary {
        let sources = pipeline
            .build_sources(&fixture_registry())
            .expect("fixture sources");
        pipeline.ingest_sources(&sources, 24).await
    }
}
