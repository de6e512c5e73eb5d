use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use oculus_core::{EquipmentItem, Marketplace};
use serde_json::Value;
use tokio::fs;

use crate::{
    equipment_from_payload, parse_search_page, AdapterContext, AdapterError, ListingSource,
    PayloadCache, SearchCriteria, SearchPage,
};

/// Replays captured search pages (`*.json` in one directory, in file-name
/// order) through the same page parser as the live source. The search window
/// is not applied: captured pages are frozen in time.
pub struct FixtureSource {
    marketplace: Marketplace,
    dir: PathBuf,
    cache: PayloadCache,
}

impl FixtureSource {
    pub fn new(marketplace: Marketplace, dir: impl Into<PathBuf>) -> Self {
        Self {
            marketplace,
            dir: dir.into(),
            cache: PayloadCache::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn page_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing fixture dir {}", self.dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ListingSource for FixtureSource {
    fn marketplace(&self) -> Marketplace {
        self.marketplace
    }

    async fn search(
        &self,
        _ctx: &AdapterContext,
        criteria: &SearchCriteria,
    ) -> Result<Vec<SearchPage>, AdapterError> {
        self.cache.clear().await;
        let mut pages = Vec::new();
        for path in self
            .page_files()
            .await?
            .into_iter()
            .take(criteria.max_pages.max(1))
        {
            let body = fs::read(&path)
                .await
                .with_context(|| format!("reading fixture {}", path.display()))?;
            let value: Value = serde_json::from_slice(&body).map_err(|err| AdapterError::Payload {
                marketplace: self.marketplace,
                reason: format!("{}: {err}", path.display()),
            })?;
            let (summaries, skipped) = parse_search_page(self.marketplace, &value)?;
            self.cache.remember(&summaries).await;
            pages.push(SearchPage {
                url: format!("file://{}", path.display()),
                body,
                summaries,
                skipped,
            });
        }
        Ok(pages)
    }

    async fn get_details(
        &self,
        _ctx: &AdapterContext,
        source_listing_id: &str,
    ) -> Result<Option<Value>, AdapterError> {
        Ok(self.cache.get(source_listing_id).await)
    }

    async fn get_equipment(
        &self,
        _ctx: &AdapterContext,
        source_listing_id: &str,
    ) -> Result<Vec<EquipmentItem>, AdapterError> {
        Ok(self
            .cache
            .get(source_listing_id)
            .await
            .map(|payload| equipment_from_payload(self.marketplace, &payload))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use chrono::Utc;
    use oculus_core::PipelineError;

    fn fixtures_dir(marketplace: Marketplace) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(marketplace.as_str())
    }

    fn criteria() -> SearchCriteria {
        SearchCriteria {
            window_hours: 24,
            page_size: 200,
            max_pages: 10,
        }
    }

    #[tokio::test]
    async fn willhaben_fixture_normalizes_with_expected_rejections() {
        let source = FixtureSource::new(Marketplace::Willhaben, fixtures_dir(Marketplace::Willhaben));
        let ctx = AdapterContext::new(Utc::now());
        let pages = source.search(&ctx, &criteria()).await.unwrap();
        assert!(!pages.is_empty());

        let mut accepted = 0;
        let mut incomplete = 0;
        for summary in pages.iter().flat_map(|p| &p.summaries) {
            let details = source
                .get_details(&ctx, &summary.source_listing_id)
                .await
                .unwrap()
                .unwrap();
            let equipment = source.get_equipment(&ctx, &summary.source_listing_id).await.unwrap();
            match normalize(Marketplace::Willhaben, &details, &equipment, ctx.fetched_at) {
                Ok(_) => accepted += 1,
                Err(PipelineError::IncompleteListing { .. }) => incomplete += 1,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(incomplete, 1);
        assert_eq!(pages.iter().map(|p| p.skipped).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn gebrauchtwagen_fixture_yields_summaries() {
        let source = FixtureSource::new(
            Marketplace::Gebrauchtwagen,
            fixtures_dir(Marketplace::Gebrauchtwagen),
        );
        let ctx = AdapterContext::new(Utc::now());
        let pages = source.search(&ctx, &criteria()).await.unwrap();
        let ids: Vec<_> = pages
            .iter()
            .flat_map(|p| &p.summaries)
            .map(|s| s.source_listing_id.as_str())
            .collect();
        assert_eq!(ids, vec!["5512093", "5512101", "5512188"]);
        assert!(source.get_equipment(&ctx, "5512093").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_search_replaces_the_cached_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("search_page_001.json");
        let write_page = |id: u64| {
            let body = serde_json::json!({ "listings": [ { "id": id, "fuel": "Diesel" } ] });
            std::fs::write(&page, serde_json::to_vec(&body).unwrap()).unwrap();
        };
        let source = FixtureSource::new(Marketplace::Gebrauchtwagen, dir.path());
        let ctx = AdapterContext::new(Utc::now());

        write_page(100);
        source.search(&ctx, &criteria()).await.unwrap();
        assert!(source.get_details(&ctx, "100").await.unwrap().is_some());

        write_page(200);
        source.search(&ctx, &criteria()).await.unwrap();
        assert!(source.get_details(&ctx, "200").await.unwrap().is_some());
        assert!(source.get_details(&ctx, "100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_fixture_dir_is_an_error() {
        let source = FixtureSource::new(Marketplace::Willhaben, "/definitely/not/here");
        let ctx = AdapterContext::new(Utc::now());
        assert!(source.search(&ctx, &criteria()).await.is_err());
    }
}
