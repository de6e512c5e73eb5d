use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oculus_adapters::{normalize, AdapterContext, AdapterError, ListingSource};
use oculus_core::{Marketplace, PipelineError};
use oculus_storage::{with_timeout, FetchError};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{RegisteredSource, SyncPipeline};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketplaceIngest {
    pub marketplace: Marketplace,
    pub pages: usize,
    /// Pages newly written to the archive; identical pages are stored once.
    pub archived: usize,
    pub summaries: usize,
    /// Ids already seen earlier in this run.
    pub duplicates: usize,
    /// Search entries without a listing id.
    pub skipped: usize,
    /// Listings the marketplace no longer serves.
    pub vanished: usize,
    pub fetch_failures: usize,
    pub rejected: usize,
    pub upserted: usize,
    /// Set when ingestion of this marketplace was aborted.
    pub error: Option<String>,
}

impl MarketplaceIngest {
    fn new(marketplace: Marketplace) -> Self {
        Self {
            marketplace,
            pages: 0,
            archived: 0,
            summaries: 0,
            duplicates: 0,
            skipped: 0,
            vanished: 0,
            fetch_failures: 0,
            rejected: 0,
            upserted: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_hours: u32,
    pub marketplaces: Vec<MarketplaceIngest>,
}

impl IngestSummary {
    pub fn failed(&self) -> impl Iterator<Item = &MarketplaceIngest> {
        self.marketplaces.iter().filter(|m| m.error.is_some())
    }

    pub fn upserted(&self) -> usize {
        self.marketplaces.iter().map(|m| m.upserted).sum()
    }
}

enum ListingOutcome {
    Upserted(DateTime<Utc>),
    Vanished,
    FetchFailed(AdapterError),
    Rejected(PipelineError),
}

fn is_blocked(err: &AdapterError) -> bool {
    matches!(err, AdapterError::Fetch(FetchError::Blocked { .. }))
}

impl SyncPipeline {
    /// The `ingest` job: every enabled marketplace in `sources.yaml`.
    pub async fn ingest(&self, window_hours: u32) -> Result<IngestSummary> {
        let registry = self.load_source_registry().await?;
        let sources = self.build_sources(&registry)?;
        Ok(self.ingest_sources(&sources, window_hours).await)
    }

    /// Marketplaces are ingested one after the other. A marketplace that
    /// fails is recorded in the summary and does not stop the others.
    pub async fn ingest_sources(
        &self,
        sources: &[RegisteredSource],
        window_hours: u32,
    ) -> IngestSummary {
        let started_at = Utc::now();
        let ctx = AdapterContext::new(started_at);
        let mut marketplaces = Vec::with_capacity(sources.len());

        for registered in sources {
            let marketplace = registered.source.marketplace();
            let span = info_span!("ingest", %marketplace, run_id = %ctx.run_id);
            let mut stats = MarketplaceIngest::new(marketplace);
            let outcome = self
                .ingest_source(registered, &ctx, window_hours, &mut stats)
                .instrument(span)
                .await;
            match outcome {
                Ok(()) => info!(
                    %marketplace,
                    pages = stats.pages,
                    upserted = stats.upserted,
                    rejected = stats.rejected,
                    "ingestion finished"
                ),
                Err(err) => {
                    error!(%marketplace, error = %format!("{err:#}"), "ingestion aborted");
                    stats.error = Some(format!("{err:#}"));
                }
            }
            marketplaces.push(stats);
        }

        IngestSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            window_hours,
            marketplaces,
        }
    }

    async fn ingest_source(
        &self,
        registered: &RegisteredSource,
        ctx: &AdapterContext,
        window_hours: u32,
        stats: &mut MarketplaceIngest,
    ) -> Result<()> {
        let source = registered.source.as_ref();
        let marketplace = source.marketplace();
        let pages = source
            .search(ctx, &registered.config.criteria(window_hours))
            .await
            .with_context(|| format!("searching {marketplace}"))?;

        let mut seen = HashSet::new();
        for page in &pages {
            stats.pages += 1;
            stats.skipped += page.skipped;
            let archived = self
                .archive
                .archive(ctx.fetched_at, marketplace, &page.body)
                .await
                .with_context(|| format!("archiving {}", page.url))?;
            if !archived.deduplicated {
                stats.archived += 1;
            }
            debug!(url = %page.url, path = %archived.relative_path.display(), "search page archived");

            for summary in &page.summaries {
                let listing_id = summary.source_listing_id.as_str();
                if !seen.insert(listing_id) {
                    stats.duplicates += 1;
                    continue;
                }
                stats.summaries += 1;
                match self.ingest_listing(source, ctx, listing_id).await? {
                    ListingOutcome::Upserted(stamp) => {
                        stats.upserted += 1;
                        debug!(listing_id, last_synced = %stamp, "lake row written");
                    }
                    ListingOutcome::Vanished => {
                        stats.vanished += 1;
                        debug!(listing_id, "listing no longer available");
                    }
                    ListingOutcome::FetchFailed(err) => {
                        stats.fetch_failures += 1;
                        warn!(%marketplace, listing_id, error = %err, "listing fetch failed, skipped");
                    }
                    ListingOutcome::Rejected(err) => {
                        stats.rejected += 1;
                        warn!(%marketplace, listing_id, error = %err, "listing skipped");
                    }
                }
            }
        }
        Ok(())
    }

    /// Row-level problems come back as an outcome; errors abort the marketplace.
    async fn ingest_listing(
        &self,
        source: &dyn ListingSource,
        ctx: &AdapterContext,
        listing_id: &str,
    ) -> Result<ListingOutcome> {
        let marketplace = source.marketplace();
        let details = match source.get_details(ctx, listing_id).await {
            Ok(Some(details)) => details,
            Ok(None) => return Ok(ListingOutcome::Vanished),
            Err(err) if is_blocked(&err) => {
                return Err(anyhow::Error::new(err).context("marketplace refused requests"))
            }
            Err(err) => return Ok(ListingOutcome::FetchFailed(err)),
        };
        let equipment = match source.get_equipment(ctx, listing_id).await {
            Ok(equipment) => equipment,
            Err(err) if is_blocked(&err) => {
                return Err(anyhow::Error::new(err).context("marketplace refused requests"))
            }
            Err(err) => return Ok(ListingOutcome::FetchFailed(err)),
        };

        let normalized = match normalize(marketplace, &details, &equipment, ctx.fetched_at) {
            Ok(normalized) => normalized,
            Err(err) if err.is_row_level() => return Ok(ListingOutcome::Rejected(err)),
            Err(err) => return Err(err.into()),
        };

        let written = with_timeout(
            self.config.db_timeout(),
            "lake upsert",
            self.store.lake().upsert_listing(&normalized),
        )
        .await;
        match written {
            Ok(stamp) => Ok(ListingOutcome::Upserted(stamp)),
            Err(err) if err.is_row_level() => Ok(ListingOutcome::Rejected(err)),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("writing {marketplace} listing {listing_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::SourceConfig;
    use async_trait::async_trait;
    use oculus_adapters::{ListingSummary, SearchCriteria, SearchPage};
    use oculus_core::{EquipmentItem, LakeTable};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn summary_of(marketplace: &str, fixtures: &IngestSummary) -> MarketplaceIngest {
        fixtures
            .marketplaces
            .iter()
            .find(|m| m.marketplace.as_str() == marketplace)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn fixtures_land_in_the_lake_with_rejections_counted() {
        let (dir, pipeline) = fixture_pipeline().await;
        let summary = ingest_fixtures(&pipeline).await;
        assert_eq!(summary.failed().count(), 0);
        assert_eq!(summary.upserted(), 6);

        let willhaben = summary_of("willhaben", &summary);
        assert_eq!(willhaben.pages, 1);
        assert_eq!(willhaben.archived, 1);
        assert_eq!(willhaben.upserted, 3);
        assert_eq!(willhaben.rejected, 1);
        assert_eq!(willhaben.skipped, 1);

        let lake = pipeline.store().lake();
        assert_eq!(lake.count(LakeTable::Willhaben).await.unwrap(), 3);
        assert_eq!(lake.count(LakeTable::Gebrauchtwagen).await.unwrap(), 3);
        assert!(lake
            .get(LakeTable::Willhaben, "873214562")
            .await
            .unwrap()
            .is_none());
        let bmw = lake
            .get(LakeTable::Willhaben, "873214559")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bmw.children.equipment.len(), 3);

        let archived_days: Vec<_> = std::fs::read_dir(dir.path().join("artifacts"))
            .unwrap()
            .collect();
        assert_eq!(archived_days.len(), 1);
    }

    #[tokio::test]
    async fn reingesting_restamps_rows_and_dedups_archive() {
        let (_dir, pipeline) = fixture_pipeline().await;
        ingest_fixtures(&pipeline).await;
        let lake = pipeline.store().lake();
        let first = lake
            .get(LakeTable::Gebrauchtwagen, "5512093")
            .await
            .unwrap()
            .unwrap();

        let again = ingest_fixtures(&pipeline).await;
        assert_eq!(summary_of("gebrauchtwagen", &again).archived, 0);
        assert_eq!(lake.count(LakeTable::Gebrauchtwagen).await.unwrap(), 3);
        let second = lake
            .get(LakeTable::Gebrauchtwagen, "5512093")
            .await
            .unwrap()
            .unwrap();
        assert!(second.last_synced_at > first.last_synced_at);
        assert_eq!(second.listing, first.listing);
    }

    /// Serves the same listing on two pages, one listing that disappears
    /// between search and detail fetch, and fails equipment lookups for `bad`.
    struct ScriptedSource;

    fn vehicle(id: &str) -> Value {
        json!({
            "id": id,
            "make": { "formatted": "Skoda" },
            "model": { "formatted": "Fabia" },
            "mileage": { "raw": 30000 },
            "powerInKW": 70,
            "fuel": "Benzin",
            "firstRegistrationDate": "2020-01-01",
            "price": { "raw": 12900.0 }
        })
    }

    fn page(ids: &[&str]) -> SearchPage {
        let summaries: Vec<_> = ids
            .iter()
            .map(|id| ListingSummary {
                source_listing_id: id.to_string(),
                payload: vehicle(id),
            })
            .collect();
        SearchPage {
            url: format!("test://{}", ids.join(",")),
            body: serde_json::to_vec(&ids).unwrap(),
            summaries,
            skipped: 0,
        }
    }

    #[async_trait]
    impl ListingSource for ScriptedSource {
        fn marketplace(&self) -> Marketplace {
            Marketplace::Gebrauchtwagen
        }

        async fn search(
            &self,
            _ctx: &AdapterContext,
            _criteria: &SearchCriteria,
        ) -> Result<Vec<SearchPage>, AdapterError> {
            Ok(vec![page(&["a", "gone"]), page(&["a", "bad", "b"])])
        }

        async fn get_details(
            &self,
            _ctx: &AdapterContext,
            id: &str,
        ) -> Result<Option<Value>, AdapterError> {
            Ok((id != "gone").then(|| vehicle(id)))
        }

        async fn get_equipment(
            &self,
            _ctx: &AdapterContext,
            id: &str,
        ) -> Result<Vec<EquipmentItem>, AdapterError> {
            if id == "bad" {
                return Err(AdapterError::Fetch(FetchError::HttpStatus {
                    status: 400,
                    url: "test://bad".into(),
                }));
            }
            Ok(Vec::new())
        }
    }

    struct DownSource;

    #[async_trait]
    impl ListingSource for DownSource {
        fn marketplace(&self) -> Marketplace {
            Marketplace::Willhaben
        }

        async fn search(
            &self,
            _ctx: &AdapterContext,
            _criteria: &SearchCriteria,
        ) -> Result<Vec<SearchPage>, AdapterError> {
            Err(AdapterError::Fetch(FetchError::Blocked {
                url: "test://search".into(),
            }))
        }

        async fn get_details(
            &self,
            _ctx: &AdapterContext,
            _id: &str,
        ) -> Result<Option<Value>, AdapterError> {
            Ok(None)
        }

        async fn get_equipment(
            &self,
            _ctx: &AdapterContext,
            _id: &str,
        ) -> Result<Vec<EquipmentItem>, AdapterError> {
            Ok(Vec::new())
        }
    }

    fn registered(marketplace: &str, source: Arc<dyn ListingSource>) -> RegisteredSource {
        let config: SourceConfig = serde_yaml::from_str(&format!(
            "marketplace: {marketplace}\ndisplay_name: test\nenabled: true\nmode: fixture\n"
        ))
        .unwrap();
        RegisteredSource { config, source }
    }

    #[tokio::test]
    async fn one_bad_listing_or_marketplace_does_not_stop_the_run() {
        let (_dir, pipeline) = fixture_pipeline().await;
        let sources = vec![
            registered("willhaben", Arc::new(DownSource)),
            registered("gebrauchtwagen", Arc::new(ScriptedSource)),
        ];
        let summary = pipeline.ingest_sources(&sources, 24).await;

        let failed: Vec<_> = summary.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].marketplace, Marketplace::Willhaben);
        assert!(failed[0].error.as_deref().unwrap().contains("blocked"));

        let scripted = summary_of("gebrauchtwagen", &summary);
        assert_eq!(scripted.pages, 2);
        assert_eq!(scripted.summaries, 4);
        assert_eq!(scripted.duplicates, 1);
        assert_eq!(scripted.vanished, 1);
        assert_eq!(scripted.fetch_failures, 1);
        assert_eq!(scripted.upserted, 2);
        assert_eq!(
            pipeline
                .store()
                .lake()
                .count(LakeTable::Gebrauchtwagen)
                .await
                .unwrap(),
            2
        );
    }
}
